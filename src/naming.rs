//! Output filenames, URLs, and planned [`Stat`] assembly.
//!
//! ## Default layout
//!
//! - filename: `{hash}-{width}.{ext}` (e.g. `5P3yLKp7Ra-640.webp`)
//! - output path: `{output_dir}/{filename}`
//! - URL: `{url_path}/{filename}`, always with `/` separators regardless of
//!   the host OS
//!
//! A `filename_format` hook replaces the filename when it returns a non-empty
//! name. A `url_format` hook replaces the whole scheme: its return value is
//! the URL verbatim and the stat gets no filename or output path, since
//! nothing implies a local location any more.

use crate::config::{NameParts, Options};
use crate::format::ImageFormat;
use crate::types::Stat;

/// `{hash}-{width}.{ext}`, or `{hash}.{ext}` without a width.
pub fn default_filename(hash: &str, width: Option<u32>, format: ImageFormat) -> String {
    match width {
        Some(width) => format!("{hash}-{width}.{}", format.extension()),
        None => format!("{hash}.{}", format.extension()),
    }
}

/// Join a URL prefix and a filename with exactly one `/` between them.
///
/// - `"/img/"` + `"a.png"` → `"/img/a.png"`
/// - `"\\assets\\img"` + `"a.png"` → `"/assets/img/a.png"`
/// - `""` + `"a.png"` → `"a.png"`
pub fn join_url(url_path: &str, filename: &str) -> String {
    let base = url_path.replace('\\', "/");
    let name = filename.replace('\\', "/");
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Build a planned stat (no size yet).
///
/// `hash` may only be `None` when a `url_format` hook is installed.
pub fn build_stat(
    hash: Option<&str>,
    src: &str,
    width: u32,
    height: u32,
    format: ImageFormat,
    options: &Options,
) -> Stat {
    let parts = NameParts {
        hash,
        src,
        width,
        format,
    };

    let (url, filename, output_path) = match &options.hooks.url_format {
        Some(hook) => ((hook.func())(&parts, options), None, None),
        None => {
            let custom = options
                .hooks
                .filename_format
                .as_ref()
                .and_then(|hook| (hook.func())(&parts, options))
                .filter(|name| !name.is_empty());
            let filename = custom
                .unwrap_or_else(|| default_filename(hash.unwrap_or_default(), Some(width), format));
            let output_path = options.output_dir.join(&filename);
            (
                join_url(&options.url_path, &filename),
                Some(filename),
                Some(output_path),
            )
        }
    };

    Stat {
        format,
        width,
        height,
        srcset: format!("{url} {width}w"),
        url,
        source_type: format.mime_type().to_string(),
        filename,
        output_path,
        size: None,
        buffer: None,
    }
}
