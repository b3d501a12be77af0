//! Parameter types for codec operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the orchestrator (which decides what to produce) and the
//! [`backend`](super::backend) (which does the pixel work). Every output stat
//! gets its own [`TranscodeParams`], so no transform state is ever shared
//! between two outputs of the same source.
//!
//! ## Types
//!
//! - [`Quality`] — Lossy encoding quality (1–100). Clamped on construction.
//! - [`CodecOptions`] — Per-format encoder parameters, passed through unmodified.
//!   Part of the content hash: changing any of them changes every filename.
//! - [`Transform`] — A single pixel operation (orientation fix, rotation, resize).
//! - [`TranscodeParams`] — Full specification for one output: transforms + target format.

use crate::format::ImageFormat;
use serde::{Deserialize, Serialize};

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for Quality {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<Quality> for u32 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JpegOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PngCompression {
    Fast,
    #[default]
    Default,
    Best,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PngOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<PngCompression>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebpOptions {
    /// The bundled encoder is lossless-only, so options validation rejects
    /// `Some(false)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lossless: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AvifOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    /// Encoder speed, 1 (slowest) to 10 (fastest).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
}

/// Per-format encoder parameters.
///
/// This is the only part of [`Options`](crate::config::Options) that feeds
/// the content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodecOptions {
    pub jpeg: JpegOptions,
    pub png: PngOptions,
    pub webp: WebpOptions,
    pub avif: AvifOptions,
}

impl CodecOptions {
    /// Encoder parameters for one output format.
    pub fn for_format(&self, format: ImageFormat) -> EncodeOptions {
        match format {
            ImageFormat::Jpeg => EncodeOptions::Jpeg(self.jpeg.clone()),
            ImageFormat::Png => EncodeOptions::Png(self.png.clone()),
            ImageFormat::Webp => EncodeOptions::Webp(self.webp.clone()),
            ImageFormat::Avif => EncodeOptions::Avif(self.avif.clone()),
            ImageFormat::Gif | ImageFormat::Tiff | ImageFormat::Svg => EncodeOptions::Plain,
        }
    }
}

/// Encoder parameters resolved for a single output.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOptions {
    Jpeg(JpegOptions),
    Png(PngOptions),
    Webp(WebpOptions),
    Avif(AvifOptions),
    /// Formats without tunable parameters.
    Plain,
}

/// A single pixel operation, applied in order before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Apply the EXIF orientation stored in the source, then discard it.
    AutoOrient,
    /// Rotate clockwise by a multiple of 90 degrees.
    Rotate(u16),
    /// Scale to `width`, preserving aspect ratio. Without `allow_enlarge`,
    /// sources already narrower than `width` are left untouched.
    Resize { width: u32, allow_enlarge: bool },
}

/// Full specification for producing one output artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeParams {
    pub format: ImageFormat,
    pub transforms: Vec<Transform>,
    pub encode: EncodeOptions,
}

impl TranscodeParams {
    pub fn new(format: ImageFormat, codec: &CodecOptions) -> Self {
        Self {
            format,
            transforms: Vec::new(),
            encode: codec.for_format(format),
        }
    }

    /// Target width of the last resize, if any.
    pub fn resize_width(&self) -> Option<u32> {
        self.transforms.iter().rev().find_map(|t| match t {
            Transform::Resize { width, .. } => Some(*width),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_deserializes_with_clamping() {
        let jpeg: JpegOptions = toml::from_str("quality = 250").unwrap();
        assert_eq!(jpeg.quality, Some(Quality::new(100)));
    }

    #[test]
    fn for_format_picks_matching_options() {
        let codec = CodecOptions {
            jpeg: JpegOptions {
                quality: Some(Quality::new(70)),
            },
            ..Default::default()
        };
        assert_eq!(
            codec.for_format(ImageFormat::Jpeg),
            EncodeOptions::Jpeg(JpegOptions {
                quality: Some(Quality::new(70))
            })
        );
        assert_eq!(codec.for_format(ImageFormat::Gif), EncodeOptions::Plain);
    }

    #[test]
    fn default_codec_options_serialize_as_empty_tables() {
        let json = serde_json::to_string(&CodecOptions::default()).unwrap();
        assert_eq!(json, r#"{"jpeg":{},"png":{},"webp":{},"avif":{}}"#);
    }

    #[test]
    fn resize_width_reads_last_resize() {
        let mut params = TranscodeParams::new(ImageFormat::Webp, &CodecOptions::default());
        assert_eq!(params.resize_width(), None);
        params.transforms.push(Transform::AutoOrient);
        params.transforms.push(Transform::Resize {
            width: 300,
            allow_enlarge: false,
        });
        assert_eq!(params.resize_width(), Some(300));
    }
}
