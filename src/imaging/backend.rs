//! Codec backend trait and shared types.
//!
//! The [`CodecBackend`] trait defines the two operations the pipeline needs
//! from a codec engine: probe (read header metadata) and transcode
//! (transform + encode one output). Everything else (which outputs to make,
//! where they go, whether they already exist) is decided before the backend
//! is called.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend): pure Rust, statically
//! linked.

use super::params::TranscodeParams;
use crate::format::ImageFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported input: {0}")]
    Unsupported(String),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Header metadata of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    /// EXIF orientation (1-8), when the container carries one.
    pub orientation: Option<u8>,
    /// Height of a single page/frame for multi-page sources.
    pub page_height: Option<u32>,
}

/// Trait for codec engines.
///
/// Implementations must be shareable across threads: transcodes for one
/// request run concurrently on the blocking pool.
pub trait CodecBackend: Send + Sync {
    /// Read dimensions, format and orientation without decoding pixels.
    fn probe(&self, data: &[u8]) -> Result<Probe, BackendError>;

    /// Apply `params.transforms` in order, then encode as `params.format`.
    fn transcode(&self, data: &[u8], params: &TranscodeParams) -> Result<Vec<u8>, BackendError>;
}

/// Compressed-size measurement used for reporting SVG sizes.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, data: &[u8]) -> u64;
}
