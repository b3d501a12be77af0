//! Pure Rust codec backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Probe (JPEG, PNG, TIFF, WebP, GIF) | `image::ImageReader` + `ImageDecoder::orientation` |
//! | Probe (AVIF) | `avif-parse` (container metadata only) |
//! | Probe / rasterize (SVG) | `resvg` (`usvg` tree + `tiny_skia` pixmap) |
//! | Orientation | `DynamicImage::apply_orientation` |
//! | Resize | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` |
//! | Encode → PNG | `PngEncoder::new_with_quality` |
//! | Encode → WebP | `WebPEncoder::new_lossless` |
//! | Encode → AVIF | `AvifEncoder::new_with_speed_quality` (rav1e) |
//! | Encode → GIF, TIFF | `DynamicImage::write_to` |
//!
//! AVIF sources are probed but not decoded: the `image` crate's `"avif"`
//! feature only enables the encoder.

use super::backend::{BackendError, CodecBackend, Probe};
use super::calculations::aspect_height;
use super::params::{EncodeOptions, PngCompression, Quality, Transform, TranscodeParams};
use crate::format::ImageFormat;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{self, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbaImage};
use resvg::{tiny_skia, usvg};
use std::io::Cursor;

const DEFAULT_QUALITY: u32 = 90;
const DEFAULT_AVIF_SPEED: u8 = 6;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn processing(context: &str) -> impl FnOnce(image::ImageError) -> BackendError + '_ {
    move |e| BackendError::ProcessingFailed(format!("{context}: {e}"))
}

fn native_format(format: image::ImageFormat) -> Result<ImageFormat, BackendError> {
    match format {
        image::ImageFormat::Jpeg => Ok(ImageFormat::Jpeg),
        image::ImageFormat::Png => Ok(ImageFormat::Png),
        image::ImageFormat::WebP => Ok(ImageFormat::Webp),
        image::ImageFormat::Avif => Ok(ImageFormat::Avif),
        image::ImageFormat::Gif => Ok(ImageFormat::Gif),
        image::ImageFormat::Tiff => Ok(ImageFormat::Tiff),
        other => Err(BackendError::Unsupported(format!("{other:?} input"))),
    }
}

fn reader(data: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, BackendError> {
    Ok(ImageReader::new(Cursor::new(data)).with_guessed_format()?)
}

fn parse_svg(data: &[u8]) -> Result<usvg::Tree, BackendError> {
    usvg::Tree::from_data(data, &usvg::Options::default())
        .map_err(|e| BackendError::ProcessingFailed(format!("Failed to parse SVG: {e}")))
}

fn svg_size(tree: &usvg::Tree) -> (u32, u32) {
    let size = tree.size();
    (
        (size.width().round() as u32).max(1),
        (size.height().round() as u32).max(1),
    )
}

/// Extract dimensions from an AVIF container (no pixel decode).
fn probe_avif(data: &[u8]) -> Result<Probe, BackendError> {
    let avif = avif_parse::read_avif(&mut Cursor::new(data))
        .map_err(|e| BackendError::ProcessingFailed(format!("Failed to parse AVIF: {e:?}")))?;
    let meta = avif.primary_item_metadata().map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to read AVIF metadata: {e:?}"))
    })?;
    Ok(Probe {
        width: meta.max_frame_width.get(),
        height: meta.max_frame_height.get(),
        format: ImageFormat::Avif,
        orientation: None,
        page_height: None,
    })
}

/// Decode pixels, returning the image and its stored EXIF orientation.
fn decode(data: &[u8]) -> Result<(DynamicImage, Orientation), BackendError> {
    let reader = reader(data)?;
    if reader.format() == Some(image::ImageFormat::Avif) {
        return Err(BackendError::Unsupported(
            "AVIF sources can be probed but not decoded".into(),
        ));
    }
    let mut decoder = reader.into_decoder().map_err(processing("Failed to decode"))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let img = DynamicImage::from_decoder(decoder).map_err(processing("Failed to decode"))?;
    Ok((img, orientation))
}

/// Rasterize an SVG at `width` pixels wide (native width when `None`).
fn rasterize_svg(data: &[u8], width: Option<u32>) -> Result<DynamicImage, BackendError> {
    let tree = parse_svg(data)?;
    let (native_width, native_height) = svg_size(&tree);
    let width = width.unwrap_or(native_width).max(1);
    let height = aspect_height(width, native_width, native_height);

    let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
        BackendError::ProcessingFailed(format!("Cannot allocate {width}x{height} canvas"))
    })?;
    let size = tree.size();
    let transform = tiny_skia::Transform::from_scale(
        width as f32 / size.width(),
        height as f32 / size.height(),
    );
    resvg::render(&tree, transform, &mut pixmap.as_mut());

    let rgba: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|pixel| {
            let c = pixel.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();
    let img = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
        BackendError::ProcessingFailed("Failed to create image from SVG pixmap".into())
    })?;
    Ok(DynamicImage::ImageRgba8(img))
}

fn apply(img: DynamicImage, transform: &Transform, orientation: Orientation) -> DynamicImage {
    match *transform {
        Transform::AutoOrient => {
            let mut img = img;
            img.apply_orientation(orientation);
            img
        }
        Transform::Rotate(degrees) => match degrees % 360 {
            90 => img.rotate90(),
            180 => img.rotate180(),
            270 => img.rotate270(),
            _ => img,
        },
        Transform::Resize {
            width,
            allow_enlarge,
        } => {
            if width == 0 || width == img.width() || (width > img.width() && !allow_enlarge) {
                return img;
            }
            let height = aspect_height(width, img.width(), img.height());
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
    }
}

fn quality_or_default(quality: Option<Quality>) -> u8 {
    quality.map_or(DEFAULT_QUALITY, Quality::value) as u8
}

/// Encode into an in-memory buffer.
fn encode(img: &DynamicImage, format: ImageFormat, options: &EncodeOptions) -> Result<Vec<u8>, BackendError> {
    let mut out = Cursor::new(Vec::new());
    match (format, options) {
        (ImageFormat::Jpeg, EncodeOptions::Jpeg(jpeg)) => {
            let encoder = JpegEncoder::new_with_quality(&mut out, quality_or_default(jpeg.quality));
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(processing("JPEG encode failed"))?;
        }
        (ImageFormat::Png, EncodeOptions::Png(opts)) => {
            let compression = match opts.compression.unwrap_or_default() {
                PngCompression::Fast => png::CompressionType::Fast,
                PngCompression::Default => png::CompressionType::Default,
                PngCompression::Best => png::CompressionType::Best,
            };
            let encoder =
                PngEncoder::new_with_quality(&mut out, compression, png::FilterType::Adaptive);
            img.write_with_encoder(encoder)
                .map_err(processing("PNG encode failed"))?;
        }
        (ImageFormat::Webp, _) => {
            let encoder = WebPEncoder::new_lossless(&mut out);
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(processing("WebP encode failed"))?;
        }
        (ImageFormat::Avif, EncodeOptions::Avif(avif)) => {
            let encoder = AvifEncoder::new_with_speed_quality(
                &mut out,
                avif.speed.unwrap_or(DEFAULT_AVIF_SPEED),
                quality_or_default(avif.quality),
            );
            img.write_with_encoder(encoder)
                .map_err(processing("AVIF encode failed"))?;
        }
        (ImageFormat::Gif, _) => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut out, image::ImageFormat::Gif)
                .map_err(processing("GIF encode failed"))?;
        }
        (ImageFormat::Tiff, _) => {
            img.write_to(&mut out, image::ImageFormat::Tiff)
                .map_err(processing("TIFF encode failed"))?;
        }
        (ImageFormat::Svg, _) => {
            return Err(BackendError::Unsupported(
                "raster images cannot be encoded as SVG".into(),
            ));
        }
        (format, options) => {
            return Err(BackendError::ProcessingFailed(format!(
                "encode options {options:?} do not match {format}"
            )));
        }
    }
    Ok(out.into_inner())
}

impl CodecBackend for RustBackend {
    fn probe(&self, data: &[u8]) -> Result<Probe, BackendError> {
        if ImageFormat::sniff_svg(data) {
            let (width, height) = svg_size(&parse_svg(data)?);
            return Ok(Probe {
                width,
                height,
                format: ImageFormat::Svg,
                orientation: None,
                page_height: None,
            });
        }

        let reader = reader(data)?;
        let format = reader
            .format()
            .ok_or_else(|| BackendError::Unsupported("unrecognized image data".into()))
            .and_then(native_format)?;
        if format == ImageFormat::Avif {
            return probe_avif(data);
        }

        let mut decoder = reader
            .into_decoder()
            .map_err(processing("Failed to read header"))?;
        let (width, height) = decoder.dimensions();
        let orientation = decoder
            .orientation()
            .ok()
            .map(Orientation::to_exif)
            .filter(|&o| o != 1);
        Ok(Probe {
            width,
            height,
            format,
            orientation,
            page_height: None,
        })
    }

    fn transcode(&self, data: &[u8], params: &TranscodeParams) -> Result<Vec<u8>, BackendError> {
        if ImageFormat::sniff_svg(data) {
            if params.format.is_svg() {
                return Ok(data.to_vec());
            }
            let img = rasterize_svg(data, params.resize_width())?;
            let img = params
                .transforms
                .iter()
                .filter(|t| !matches!(t, Transform::Resize { .. }))
                .fold(img, |img, t| apply(img, t, Orientation::NoTransforms));
            return encode(&img, params.format, &params.encode);
        }

        let (img, orientation) = decode(data)?;
        let img = params
            .transforms
            .iter()
            .fold(img, |img, t| apply(img, t, orientation));
        encode(&img, params.format, &params.encode)
    }
}
