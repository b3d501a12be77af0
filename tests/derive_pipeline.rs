//! End-to-end derivations through the pure-Rust codec backend.
//!
//! Sources are generated with the `image` crate; outputs are written to a
//! temp directory and probed back to check what actually landed on disk.

use image::{DynamicImage, Rgb, RgbImage};
use responsive_images::imaging::{CodecBackend, RustBackend};
use responsive_images::{
    Deriver, FormatRequest, ImageFormat, Options, SvgShortCircuit, WidthRequest,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_jpeg(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Jpeg)
        .unwrap();
    let path = dir.join(name);
    std::fs::write(&path, buf.into_inner()).unwrap();
    path
}

fn write_svg(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="100" viewBox="0 0 200 100"><rect width="200" height="100" fill="#246"/></svg>"##,
    )
    .unwrap();
    path
}

fn options(tmp: &TempDir, widths: Vec<WidthRequest>, formats: &str) -> Options {
    Options {
        widths,
        formats: FormatRequest::parse_list(formats).unwrap(),
        output_dir: tmp.path().join("img"),
        url_path: "/assets/img/".into(),
        ..Options::default()
    }
}

#[tokio::test]
async fn jpeg_to_webp_and_jpeg() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 1280, 853);
    let deriver = Deriver::default();
    let opts = options(
        &tmp,
        vec![WidthRequest::Auto, WidthRequest::Pixels(640)],
        "webp,jpeg",
    );

    let plan = deriver.derive(src.as_path(), opts).await.unwrap();

    assert_eq!(
        plan.formats().collect::<Vec<_>>(),
        vec![ImageFormat::Webp, ImageFormat::Jpeg]
    );
    let backend = RustBackend::new();
    for (format, stats) in plan.groups() {
        let widths: Vec<u32> = stats.iter().map(|s| s.width).collect();
        assert_eq!(widths, vec![640, 1280], "{format}");
        for stat in stats {
            let path = stat.output_path.as_ref().unwrap();
            let data = std::fs::read(path).unwrap();
            assert_eq!(data.len() as u64, stat.size.unwrap());

            let probe = backend.probe(&data).unwrap();
            assert_eq!(probe.format, format);
            assert_eq!((probe.width, probe.height), (stat.width, stat.height));
            assert!(stat.url.starts_with("/assets/img/"));
            assert_eq!(stat.srcset, format!("{} {}w", stat.url, stat.width));
        }
    }
    let small = &plan.get(ImageFormat::Jpeg).unwrap()[0];
    assert_eq!(small.height, 427);
}

#[tokio::test]
async fn auto_width_keeps_native_dimensions() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 1280, 853);
    let opts = options(&tmp, vec![WidthRequest::Auto], "webp,jpeg");

    let plan = Deriver::default().derive(src.as_path(), opts).await.unwrap();

    let stats: Vec<_> = plan
        .stats()
        .map(|s| (s.format, s.width, s.height))
        .collect();
    assert_eq!(
        stats,
        vec![
            (ImageFormat::Webp, 1280, 853),
            (ImageFormat::Jpeg, 1280, 853),
        ]
    );
}

#[tokio::test]
async fn hash_ignores_widths_formats_and_output_dir() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 600, 400);
    let deriver = Deriver::default();

    let first = options(&tmp, vec![WidthRequest::Pixels(300)], "webp");
    let second = Options {
        output_dir: tmp.path().join("elsewhere"),
        ..options(
            &tmp,
            vec![WidthRequest::Auto, WidthRequest::Pixels(150)],
            "png,jpeg",
        )
    };

    let prefixes = |plan: &responsive_images::FullStatsPlan| {
        plan.stats()
            .map(|s| {
                let name = s.filename.as_deref().unwrap();
                name.split('-').next().unwrap().to_string()
            })
            .collect::<Vec<_>>()
    };
    let a = prefixes(&deriver.derive(src.as_path(), first).await.unwrap());
    let b = prefixes(&deriver.derive(src.as_path(), second).await.unwrap());

    assert_eq!(a.len(), 1);
    assert_eq!(b.len(), 4);
    assert!(b.iter().all(|prefix| *prefix == a[0]));
}

#[tokio::test]
async fn stats_sync_predicts_derived_urls() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 400, 300);
    let deriver = Deriver::default();
    let opts = options(&tmp, vec![WidthRequest::Pixels(200)], "auto,png");

    let predicted = deriver.stats_sync(src.as_path(), opts.clone()).unwrap();
    assert!(!tmp.path().join("img").exists());

    let derived = deriver.derive(src.as_path(), opts).await.unwrap();
    let urls = |plan: &responsive_images::FullStatsPlan| {
        plan.stats().map(|s| s.url.clone()).collect::<Vec<_>>()
    };
    assert_eq!(urls(&predicted), urls(&derived));
    assert_eq!(
        derived.formats().collect::<Vec<_>>(),
        vec![ImageFormat::Jpeg, ImageFormat::Png]
    );
}

#[tokio::test]
async fn second_run_reuses_files() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 300, 200);
    let opts = options(&tmp, vec![WidthRequest::Pixels(150)], "png");

    let first = Deriver::default()
        .derive(src.as_path(), opts.clone())
        .await
        .unwrap();
    let path = first.stats().next().unwrap().output_path.clone().unwrap();
    let written = std::fs::metadata(&path).unwrap().modified().unwrap();

    let second = Deriver::default().derive(src.as_path(), opts).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), written);
}

#[tokio::test]
async fn svg_short_circuit_emits_only_svg() {
    let tmp = TempDir::new().unwrap();
    let src = write_svg(tmp.path(), "logo.svg");
    let opts = Options {
        svg_short_circuit: SvgShortCircuit::On,
        ..options(&tmp, vec![WidthRequest::Pixels(100)], "jpeg,svg")
    };

    let plan = Deriver::default().derive(src.as_path(), opts).await.unwrap();
    assert_eq!(plan.len(), 1);
    let svg = plan.stats().next().unwrap();
    assert_eq!(svg.format, ImageFormat::Svg);
    assert_eq!((svg.width, svg.height), (200, 100));
    assert_eq!(svg.source_type, "image/svg+xml");
    assert_eq!(
        std::fs::read(svg.output_path.as_ref().unwrap()).unwrap(),
        std::fs::read(&src).unwrap()
    );
}

#[tokio::test]
async fn svg_rasterized_and_upscaled() {
    let tmp = TempDir::new().unwrap();
    let src = write_svg(tmp.path(), "logo.svg");
    let opts = options(&tmp, vec![WidthRequest::Pixels(400)], "png");

    let plan = Deriver::default().derive(src.as_path(), opts).await.unwrap();
    let png = plan.stats().next().unwrap();
    assert_eq!((png.width, png.height), (400, 200));
    let data = std::fs::read(png.output_path.as_ref().unwrap()).unwrap();
    let probe = RustBackend::new().probe(&data).unwrap();
    assert_eq!((probe.width, probe.height), (400, 200));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let src = write_jpeg(tmp.path(), "photo.jpg", 200, 100);
    let opts = Options {
        dry_run: true,
        ..options(&tmp, vec![WidthRequest::Pixels(100)], "webp")
    };

    let plan = Deriver::default().derive(src.as_path(), opts).await.unwrap();
    let stat = plan.stats().next().unwrap();
    assert!(!tmp.path().join("img").exists());
    let buffer = stat.buffer.as_ref().unwrap();
    let probe = RustBackend::new().probe(buffer).unwrap();
    assert_eq!((probe.width, probe.height), (100, 50));
}

#[tokio::test]
async fn missing_source_is_input_error() {
    let tmp = TempDir::new().unwrap();
    let err = Deriver::default()
        .derive(
            tmp.path().join("missing.jpg").as_path(),
            options(&tmp, vec![WidthRequest::Auto], "webp"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        responsive_images::DeriveError::Input { .. }
    ));
}
