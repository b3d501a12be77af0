//! Output formats and the format/width request types found in [`Options`](crate::config::Options).
//!
//! Requests are what the caller asks for; they may contain `auto` entries that
//! only resolve to a concrete [`ImageFormat`] or pixel width once the source
//! has been probed. Resolution lives in
//! [`calculations`](crate::imaging::calculations).
//!
//! ## Accepted spellings
//!
//! | Input | Meaning |
//! |---|---|
//! | `"jpeg"`, `"jpg"` | [`ImageFormat::Jpeg`] |
//! | `"tiff"`, `"tif"` | [`ImageFormat::Tiff`] |
//! | `"auto"`, `""`, `null` | use the source's native format / width |
//! | `"webp,jpeg"` | a comma-separated list is split into entries |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A concrete image format the pipeline can emit or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
    Gif,
    Tiff,
    Svg,
}

impl ImageFormat {
    /// Parse a format name, resolving aliases (`jpg`, `tif`, `svg+xml`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "gif" => Some(Self::Gif),
            "tiff" | "tif" => Some(Self::Tiff),
            "svg" | "svg+xml" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Canonical name, also used as the output file extension.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Svg => "svg",
        }
    }

    /// MIME type reported as the stat's `source_type`.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Gif => "image/gif",
            Self::Tiff => "image/tiff",
            Self::Svg => "image/svg+xml",
        }
    }

    pub fn is_svg(self) -> bool {
        self == Self::Svg
    }

    /// Whether `data` looks like an SVG document (checks the first 1 KiB).
    pub fn sniff_svg(data: &[u8]) -> bool {
        let head = &data[..data.len().min(1024)];
        let text = String::from_utf8_lossy(head);
        let text = text.trim_start_matches('\u{feff}').trim_start();
        (text.starts_with("<?xml") || text.starts_with("<svg") || text.starts_with("<!--"))
            && text.contains("<svg")
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown image format: {s:?}"))
    }
}

/// One entry of the `formats` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatRequest {
    /// Use the source's native format.
    Auto,
    Format(ImageFormat),
}

impl FormatRequest {
    /// Parse a comma-separated list such as `"webp,jpeg"` or `"auto,avif"`.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, String> {
        list.split(',').map(str::parse).collect()
    }
}

impl From<ImageFormat> for FormatRequest {
    fn from(format: ImageFormat) -> Self {
        Self::Format(format)
    }
}

impl FromStr for FormatRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        trimmed.parse().map(Self::Format)
    }
}

impl fmt::Display for FormatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Format(format) => format.fmt(f),
        }
    }
}

impl Serialize for FormatRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FormatRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(Self::Auto),
            Some(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Deserialize the `formats` option from either a list or a comma-separated string.
pub(crate) fn deserialize_format_list<'de, D>(deserializer: D) -> Result<Vec<FormatRequest>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<FormatRequest>),
        Joined(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(list) => Ok(list),
        Raw::Joined(joined) => {
            FormatRequest::parse_list(&joined).map_err(serde::de::Error::custom)
        }
    }
}

/// One entry of the `widths` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WidthRequest {
    /// Use the source's native width.
    Auto,
    Pixels(u32),
}

impl WidthRequest {
    /// Resolve against a native width. `0` is treated like `Auto`.
    pub fn or_native(self, native: u32) -> u32 {
        match self {
            Self::Auto | Self::Pixels(0) => native,
            Self::Pixels(px) => px,
        }
    }
}

impl From<u32> for WidthRequest {
    fn from(px: u32) -> Self {
        Self::Pixels(px)
    }
}

impl From<Option<u32>> for WidthRequest {
    fn from(px: Option<u32>) -> Self {
        px.map_or(Self::Auto, Self::Pixels)
    }
}

impl FromStr for WidthRequest {
    type Err = String;

    /// `"auto"`, `""` or a pixel count.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        name.parse::<u32>()
            .map(Self::Pixels)
            .map_err(|_| format!("invalid width: {name:?}"))
    }
}

impl Serialize for WidthRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Pixels(px) => serializer.serialize_u32(*px),
        }
    }
}

impl<'de> Deserialize<'de> for WidthRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Pixels(u32),
            Named(String),
            Unset(()),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Pixels(px) => Ok(Self::Pixels(px)),
            Raw::Unset(()) => Ok(Self::Auto),
            Raw::Named(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}
