//! Image processing: pure Rust, statically linked.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Probe** | `image::ImageReader` header decode, `avif-parse`, `usvg` |
//! | **Resize** | Lanczos3 `resize_exact` |
//! | **Encode** | `image` JPEG / PNG / WebP / AVIF / GIF / TIFF encoders |
//! | **SVG → raster** | `resvg` onto a `tiny_skia::Pixmap` |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for width/format/dimension policy (unit testable)
//! - **Parameters**: Data structures describing one output's transforms and encoder settings
//! - **Backend**: [`CodecBackend`] trait + [`RustBackend`]
//! - **Operations**: High-level functions combining calculations + backend

pub mod backend;
pub mod calculations;
pub mod operations;
pub mod params;
pub mod rust_backend;

pub use backend::{BackendError, CodecBackend, Probe, SizeEstimator};
pub use calculations::{aspect_height, resolve_formats, resolve_widths};
pub use operations::{build_plan, plan_transcode, produce};
pub use params::{CodecOptions, EncodeOptions, Quality, Transform, TranscodeParams};
pub use rust_backend::RustBackend;
