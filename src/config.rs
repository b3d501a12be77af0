//! Derivation options.
//!
//! [`Options`] is the single record every entry point takes. It can be built
//! in code (`Options { widths: ..., ..Options::default() }`) or loaded from a
//! TOML file, in which case every key is optional and unknown keys are
//! rejected to catch typos early.
//!
//! ## Options File
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! widths = ["auto"]               # "auto", "", 0 all mean the source width
//! formats = ["webp", "jpeg"]      # or a comma-separated string: "webp,jpeg"
//! # concurrency = 10              # shared job limit (omit to leave unchanged)
//! output_dir = "img/"
//! url_path = "/img/"
//! svg_short_circuit = false       # false | true | "size"
//! svg_allow_upscale = true
//! svg_compression_size = ""       # "" | "br"
//! minimum_threshold = 1.25
//! use_cache = true
//! dry_run = false
//! stats_only = false
//! fix_orientation = false
//! hash_length = 10
//!
//! [cache_options]
//! duration = "1d"
//! directory = ".cache"
//!
//! [codec.jpeg]
//! quality = 90
//! ```
//!
//! ## Hooks
//!
//! Behaviour that cannot be expressed as data is plugged in through
//! [`Hooks`]: a fixed set of named, optional closures. A hook that is absent
//! means the built-in behaviour; a hook that is present replaces it entirely.
//! Hooks are never read from a file.

use crate::format::{FormatRequest, ImageFormat, WidthRequest};
use crate::imaging::params::{CodecOptions, TranscodeParams};
use crate::remote::parse_duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Options validation error: {0}")]
    Validation(String),
}

/// Options for one derivation call.
///
/// All fields have defaults; see the module docs for the file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Requested output widths. Order does not matter.
    pub widths: Vec<WidthRequest>,
    /// Requested output formats, in output order.
    #[serde(deserialize_with = "crate::format::deserialize_format_list")]
    pub formats: Vec<FormatRequest>,
    /// Shared job limit, applied before the request is admitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub output_dir: PathBuf,
    pub url_path: String,
    pub svg_short_circuit: SvgShortCircuit,
    pub svg_allow_upscale: bool,
    pub svg_compression_size: SvgCompressionSize,
    /// Minimum ratio between a width and the native width before an extra
    /// native-sized output is emitted in place of an upscale.
    pub minimum_threshold: f64,
    /// Reuse outputs already present on disk.
    pub use_cache: bool,
    /// Never write to disk; stats carry their encoded buffers instead.
    pub dry_run: bool,
    /// Compute stats without invoking the codec.
    pub stats_only: bool,
    pub fix_orientation: bool,
    pub hash_length: usize,
    /// Dimensions to assume for remote sources under `stats_only`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_image_metadata: Option<RemoteImageMetadata>,
    pub cache_options: RemoteCacheOptions,
    pub codec: CodecOptions,
    #[serde(skip)]
    pub hooks: Hooks,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            widths: vec![WidthRequest::Auto],
            formats: vec![
                FormatRequest::Format(ImageFormat::Webp),
                FormatRequest::Format(ImageFormat::Jpeg),
            ],
            concurrency: None,
            output_dir: PathBuf::from("img/"),
            url_path: "/img/".to_string(),
            svg_short_circuit: SvgShortCircuit::Off,
            svg_allow_upscale: true,
            svg_compression_size: SvgCompressionSize::Raw,
            minimum_threshold: 1.25,
            use_cache: true,
            dry_run: false,
            stats_only: false,
            fix_orientation: false,
            hash_length: 10,
            remote_image_metadata: None,
            cache_options: RemoteCacheOptions::default(),
            codec: CodecOptions::default(),
            hooks: Hooks::default(),
        }
    }
}

impl Options {
    /// Validate values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.formats.is_empty() {
            return Err(ConfigError::Validation("formats must not be empty".into()));
        }
        if !self.minimum_threshold.is_finite() || self.minimum_threshold < 1.0 {
            return Err(ConfigError::Validation(format!(
                "minimum_threshold must be a number >= 1, got {}",
                self.minimum_threshold
            )));
        }
        if !(1..=43).contains(&self.hash_length) {
            return Err(ConfigError::Validation(format!(
                "hash_length must be 1-43, got {}",
                self.hash_length
            )));
        }
        if self.concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "concurrency must be at least 1".into(),
            ));
        }
        if let Some(meta) = &self.remote_image_metadata {
            if meta.width == 0 || meta.height == 0 {
                return Err(ConfigError::Validation(
                    "remote_image_metadata dimensions must be non-zero".into(),
                ));
            }
        }
        if self.codec.webp.lossless == Some(false) {
            return Err(ConfigError::Validation(
                "codec.webp.lossless = false is not supported; WebP output is lossless".into(),
            ));
        }
        if let Err(e) = parse_duration(&self.cache_options.duration) {
            return Err(ConfigError::Validation(format!("cache_options.duration: {e}")));
        }
        if let Some(speed) = self.codec.avif.speed {
            if !(1..=10).contains(&speed) {
                return Err(ConfigError::Validation(format!(
                    "codec.avif.speed must be 1-10, got {speed}"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate options from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: Options = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// How an `svg` output ends the plan for an SVG source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SvgShortCircuit {
    /// Raster outputs are always produced.
    #[default]
    Off,
    /// Nothing but the `svg` output is produced.
    On,
    /// Raster outputs larger than the SVG are replaced by it.
    Size,
}

impl Serialize for SvgShortCircuit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Off => serializer.serialize_bool(false),
            Self::On => serializer.serialize_bool(true),
            Self::Size => serializer.serialize_str("size"),
        }
    }
}

impl<'de> Deserialize<'de> for SvgShortCircuit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Named(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => Ok(Self::Off),
            Raw::Flag(true) => Ok(Self::On),
            Raw::Named(name) if name == "size" => Ok(Self::Size),
            Raw::Named(name) => Err(serde::de::Error::custom(format!(
                "svg_short_circuit must be true, false or \"size\", got {name:?}"
            ))),
        }
    }
}

/// How the byte size of an `svg` output is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvgCompressionSize {
    /// Raw file size.
    #[default]
    #[serde(rename = "")]
    Raw,
    /// Brotli-compressed size, measured by an injected
    /// [`SizeEstimator`](crate::imaging::SizeEstimator).
    #[serde(rename = "br")]
    Brotli,
}

/// Assumed dimensions for a remote source that is never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteImageMetadata {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
}

/// Freshness settings for the remote fetch cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteCacheOptions {
    /// `"30s"`, `"10m"`, `"4h"`, `"1d"`, `"2w"`, `"1y"`, or `"*"` (never expires).
    pub duration: String,
    pub directory: PathBuf,
}

impl Default for RemoteCacheOptions {
    fn default() -> Self {
        Self {
            duration: "1d".to_string(),
            directory: PathBuf::from(".cache"),
        }
    }
}

/// The naming inputs handed to filename and URL hooks.
#[derive(Debug, Clone, Copy)]
pub struct NameParts<'a> {
    /// Content hash. `None` under `stats_only` with a URL hook.
    pub hash: Option<&'a str>,
    /// The source as given by the caller (path, URL, or `"<buffer>"`).
    pub src: &'a str,
    pub width: u32,
    pub format: ImageFormat,
}

pub type FilenameFormatFn = dyn Fn(&NameParts<'_>, &Options) -> Option<String> + Send + Sync;
pub type UrlFormatFn = dyn Fn(&NameParts<'_>, &Options) -> String + Send + Sync;
pub type TransformFn = dyn Fn(&mut TranscodeParams) + Send + Sync;
/// Produces the output bytes for one format from the source bytes.
pub type FormatHookFn = dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync;

/// A named closure. The name stands in for the closure in request
/// signatures, so two hooks with the same name are treated as equivalent.
pub struct Hook<F: ?Sized> {
    name: String,
    func: Arc<F>,
}

impl<F: ?Sized> Hook<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn func(&self) -> &F {
        &self.func
    }

    pub(crate) fn signature(&self) -> String {
        format!("<fn>{}", self.name)
    }
}

impl<F: ?Sized> Clone for Hook<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<F: ?Sized> fmt::Debug for Hook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.name)
    }
}

impl Hook<FilenameFormatFn> {
    pub fn filename_format(
        name: impl Into<String>,
        func: impl Fn(&NameParts<'_>, &Options) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl Hook<UrlFormatFn> {
    pub fn url_format(
        name: impl Into<String>,
        func: impl Fn(&NameParts<'_>, &Options) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl Hook<TransformFn> {
    pub fn transform(
        name: impl Into<String>,
        func: impl Fn(&mut TranscodeParams) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl Hook<FormatHookFn> {
    pub fn format(
        name: impl Into<String>,
        func: impl Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Emits the source bytes unchanged.
    pub fn passthrough() -> Self {
        Self::format("passthrough", |source| Ok(source.to_vec()))
    }
}

/// Optional capability slots.
#[derive(Debug, Clone)]
pub struct Hooks {
    pub filename_format: Option<Hook<FilenameFormatFn>>,
    pub url_format: Option<Hook<UrlFormatFn>>,
    pub transform: Option<Hook<TransformFn>>,
    /// Per-format output producers that replace the codec for that format.
    pub format: BTreeMap<ImageFormat, Hook<FormatHookFn>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            filename_format: None,
            url_format: None,
            transform: None,
            format: BTreeMap::from([(ImageFormat::Svg, Hook::passthrough())]),
        }
    }
}

impl Hooks {
    /// Hook names as they appear in a request signature.
    pub(crate) fn signature_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Some(hook) = &self.filename_format {
            map.insert("filename_format".into(), hook.signature().into());
        }
        if let Some(hook) = &self.url_format {
            map.insert("url_format".into(), hook.signature().into());
        }
        if let Some(hook) = &self.transform {
            map.insert("transform".into(), hook.signature().into());
        }
        let formats: serde_json::Map<String, serde_json::Value> = self
            .format
            .iter()
            .map(|(format, hook)| (format.to_string(), hook.signature().into()))
            .collect();
        map.insert("format".into(), formats.into());
        serde_json::Value::Object(map)
    }
}

/// Returns a fully-commented stock options file with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_options_toml() -> &'static str {
    r##"# responsive-images options
# =========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# Output widths in pixels. "auto" (or 0) means the source's own width.
# Widths above the source width are never upscaled: they collapse into one
# source-sized output, or are dropped when a smaller width is already close.
widths = ["auto"]

# Output formats, in srcset order. "auto" means the source's own format.
# Aliases: "jpg" -> jpeg, "tif" -> tiff. A comma-separated string also works.
formats = ["webp", "jpeg"]

# Maximum number of derivations running at once, shared by all requests.
# Omit to keep the current limit (10 unless changed).
# concurrency = 10

# Where files are written, and the public URL prefix they are served from.
output_dir = "img/"
url_path = "/img/"

# SVG sources only.
#   false  - produce every requested format
#   true   - when "svg" is requested, produce nothing else
#   "size" - drop raster outputs that end up larger than the SVG
svg_short_circuit = false
# Allow raster outputs of an SVG source wider than its declared size.
svg_allow_upscale = true
# Report the SVG size as "" (raw bytes) or "br" (brotli-compressed bytes;
# requires a size estimator to be installed by the embedding program).
svg_compression_size = ""

# A source-sized output replaces an oversized width only when the previous
# width times this factor still fits within the source width.
minimum_threshold = 1.25

# Reuse outputs that already exist on disk.
use_cache = true
# Never write files; results carry their encoded bytes instead.
dry_run = false
# Only compute metadata: no encoding, no files.
stats_only = false
# Always apply EXIF orientation (quarter turns are always corrected).
fix_orientation = false
# Length of the content hash in filenames (1-43).
hash_length = 10

# Dimensions to assume for remote sources under stats_only.
# [remote_image_metadata]
# width = 1280
# height = 853
# format = "jpeg"

# ---------------------------------------------------------------------------
# Remote fetch cache
# ---------------------------------------------------------------------------
[cache_options]
# How long a fetched remote image stays fresh: "30s", "10m", "4h", "1d",
# "2w", "1y", or "*" for never.
duration = "1d"
directory = ".cache"

# ---------------------------------------------------------------------------
# Codec parameters (passed to the encoder unmodified; part of the hash)
# ---------------------------------------------------------------------------
[codec.jpeg]
# quality = 90

[codec.png]
# compression = "default"    # "fast" | "default" | "best"

[codec.webp]
# lossless = true            # WebP output is always lossless

[codec.avif]
# quality = 90
# speed = 6                  # 1 (slowest) - 10 (fastest)
"##
}
