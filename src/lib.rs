//! # Responsive Images
//!
//! Derives a responsive image set from one source image: every requested
//! width in every requested format, named by content hash, with the
//! metadata (`url`, `srcset`, MIME type, dimensions, byte size) needed to
//! emit `<picture>` / `srcset` markup.
//!
//! ```no_run
//! # async fn example() -> Result<(), responsive_images::DeriveError> {
//! use responsive_images::{FormatRequest, ImageFormat, Options, WidthRequest};
//!
//! let options = Options {
//!     widths: vec![WidthRequest::Auto, WidthRequest::Pixels(640)],
//!     formats: vec![FormatRequest::Format(ImageFormat::Webp), FormatRequest::Auto],
//!     ..Options::default()
//! };
//! let plan = responsive_images::derive(std::path::Path::new("photo.jpg"), options).await?;
//! for stat in plan.stats() {
//!     println!("{} {}", stat.source_type, stat.srcset);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture: One Request, Three Phases
//!
//! ```text
//! 1. Acquire      path / buffer / URL  →  source bytes
//! 2. Plan         probe + options      →  FullStatsPlan (urls, dimensions)
//! 3. Materialize  plan                 →  files on disk + sizes
//! ```
//!
//! Planning never touches the codec beyond a header probe, which is what
//! makes [`stats_sync`] cheap and lets it agree with [`derive`] on every URL.
//!
//! Around the pipeline sit two pieces of shared state owned by a [`Deriver`]:
//! a [`JobQueue`](queue::JobQueue) bounding how many derivations run at
//! once, and a [`DedupCache`](cache::DedupCache) that makes identical
//! concurrent requests share one job.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`deriver`] | The service: validation, deduplication, scheduling |
//! | [`process`] | Per-request typestate pipeline and [`DeriveError`] |
//! | [`imaging`] | Width/format policy, transcode parameters, codec backends |
//! | [`naming`] | Output filenames, URLs, stat assembly |
//! | [`hash`] | Content hashing and canonical JSON |
//! | [`cache`] | Request signatures and the dedup cache |
//! | [`queue`] | FIFO job queue with a runtime-adjustable limit |
//! | [`remote`] | HTTP fetch cache for remote sources |
//! | [`source`] | Source descriptors (path, buffer, URL) |
//! | [`config`] | [`Options`], hooks, TOML loading and validation |
//! | [`types`] | [`Stat`], [`FullStatsPlan`], source metadata |
//! | [`output`] | CLI output formatting |
//! | [`logging`] | CLI log setup |
//!
//! # Design Decisions
//!
//! ## Content-Addressed Names
//!
//! Output names start with a hash of the source bytes plus the codec
//! settings, not of the request. Asking for another width adds files next to
//! the existing ones; changing a quality setting renames everything, so a
//! CDN never serves a stale encode under a reused name.
//!
//! ## Pure-Rust Codecs
//!
//! [`RustBackend`](imaging::RustBackend) uses the `image` crate for raster
//! codecs and `resvg` for SVG. No system libraries are needed. The
//! [`CodecBackend`](imaging::CodecBackend) trait is the seam for anything
//! else, and what the test suite mocks.

pub mod cache;
pub mod config;
pub mod deriver;
pub mod format;
pub mod hash;
pub mod imaging;
pub mod logging;
pub mod naming;
pub mod output;
pub mod process;
pub mod queue;
pub mod remote;
pub mod source;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{Hook, Hooks, Options, SvgCompressionSize, SvgShortCircuit};
pub use deriver::Deriver;
pub use format::{FormatRequest, ImageFormat, WidthRequest};
pub use process::DeriveError;
pub use source::Source;
pub use types::{FullStatsPlan, SourceMetadata, Stat};

/// [`Deriver::derive`] on the process-wide default.
pub async fn derive(
    source: impl Into<Source>,
    options: Options,
) -> Result<FullStatsPlan, DeriveError> {
    Deriver::global().derive(source, options).await
}

/// [`Deriver::stats_sync`] on the process-wide default.
pub fn stats_sync(
    source: impl Into<Source>,
    options: Options,
) -> Result<FullStatsPlan, DeriveError> {
    Deriver::global().stats_sync(source, options)
}

/// [`Deriver::stats_by_dimensions_sync`] on the process-wide default.
pub fn stats_by_dimensions_sync(
    source: impl Into<Source>,
    width: u32,
    height: u32,
    options: Options,
) -> Result<FullStatsPlan, DeriveError> {
    Deriver::global().stats_by_dimensions_sync(source, width, height, options)
}

/// Job limit of the process-wide default.
pub fn concurrency() -> usize {
    Deriver::global().concurrency()
}

/// Change the job limit of the process-wide default.
pub fn set_concurrency(limit: usize) {
    Deriver::global().set_concurrency(limit);
}
