//! Per-request derivation pipeline.
//!
//! One [`Derivation`] walks a single source through three states:
//!
//! ```text
//! Created ──acquire──▶ InputAcquired ──plan──▶ PlanComputed ──materialize──▶ FullStatsPlan
//! ```
//!
//! Each transition consumes the previous state, so a plan cannot be
//! materialized before it exists and input cannot be read twice. The content
//! hash is computed at most once per derivation and shared by every output.
//!
//! ## Materialization
//!
//! Every planned stat is produced concurrently. For each one:
//!
//! 1. With `use_cache`, an output file that already exists is reused as-is
//!    (its size is read from disk, the image is not re-encoded).
//! 2. Otherwise the output is produced on the blocking pool, through a
//!    format hook when one is registered or the [`CodecBackend`] otherwise.
//! 3. Unless `dry_run`, the bytes are written to the stat's output path.
//!    Stats with no output path, and all stats under `dry_run`, carry the
//!    bytes in [`Stat::buffer`] instead.
//!
//! The first failing output fails the whole derivation.

use crate::config::{ConfigError, Options, SvgCompressionSize, SvgShortCircuit};
use crate::imaging::backend::{BackendError, CodecBackend, SizeEstimator};
use crate::imaging::operations::{build_plan, plan_transcode, produce};
use crate::remote::FetchError;
use crate::source::Source;
use crate::types::{FullStatsPlan, SourceMetadata, Stat};
use bytes::Bytes;
use futures::future::try_join_all;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by a derivation.
///
/// Cloneable so one failed job can be reported to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeriveError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Cannot read {src}: {reason}")]
    Input { src: String, reason: String },
    #[error("Failed to produce {target}: {reason}")]
    Materialization { target: String, reason: String },
}

impl DeriveError {
    pub(crate) fn input(source: &Source, reason: impl fmt::Display) -> Self {
        Self::Input {
            src: source.display_name(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn materialization(target: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Materialization {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<ConfigError> for DeriveError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<BackendError> for DeriveError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unsupported(reason) => Self::UnsupportedFormat(reason),
            other => Self::materialization("output", other),
        }
    }
}

impl From<FetchError> for DeriveError {
    fn from(err: FetchError) -> Self {
        match &err {
            FetchError::Http { url, .. } | FetchError::Status { url, .. } => Self::Input {
                src: url.clone(),
                reason: err.to_string(),
            },
            FetchError::Duration(_) => Self::Configuration(err.to_string()),
            FetchError::Io(_) => Self::Input {
                src: "remote cache".into(),
                reason: err.to_string(),
            },
        }
    }
}

/// Nothing read yet.
#[derive(Debug)]
pub struct Created;

/// Source bytes in hand (`None` for remote sources planned from
/// `remote_image_metadata` without fetching).
#[derive(Debug)]
pub struct InputAcquired {
    bytes: Option<Bytes>,
}

/// Outputs planned, nothing encoded.
#[derive(Debug)]
pub struct PlanComputed {
    bytes: Option<Bytes>,
    meta: SourceMetadata,
    plan: FullStatsPlan,
}

/// One source moving through the pipeline.
#[derive(Debug)]
pub struct Derivation<S> {
    source: Source,
    options: Arc<Options>,
    hash: OnceLock<String>,
    state: S,
}

impl<S> Derivation<S> {
    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn advance<T>(self, state: T) -> Derivation<T> {
        Derivation {
            source: self.source,
            options: self.options,
            hash: self.hash,
            state,
        }
    }

    /// Content hash, computed on first use.
    fn content_hash(&self, bytes: Option<&[u8]>) -> Result<&str, DeriveError> {
        if let Some(hash) = self.hash.get() {
            return Ok(hash);
        }
        let hash = self.source.content_hash(bytes, &self.options)?;
        Ok(self.hash.get_or_init(|| hash))
    }
}

impl Derivation<Created> {
    pub fn new(source: Source, options: Arc<Options>) -> Self {
        Self {
            source,
            options,
            hash: OnceLock::new(),
            state: Created,
        }
    }

    /// Read, or fetch, the source.
    ///
    /// A remote source under `stats_only` is not fetched at all; its
    /// dimensions must then come from `remote_image_metadata`.
    pub async fn acquire(self) -> Result<Derivation<InputAcquired>, DeriveError> {
        let bytes = if self.source.is_remote() && self.options.stats_only {
            if self.options.remote_image_metadata.is_none() {
                return Err(DeriveError::Configuration(format!(
                    "{}: remote stats without fetching need remote_image_metadata",
                    self.source.display_name()
                )));
            }
            None
        } else {
            Some(self.source.read(&self.options).await?)
        };
        Ok(self.advance(InputAcquired { bytes }))
    }

    /// Read local input without a runtime. Remote sources are not fetched.
    pub fn acquire_sync(self) -> Result<Derivation<InputAcquired>, DeriveError> {
        let bytes = self.source.read_sync()?;
        Ok(self.advance(InputAcquired { bytes }))
    }
}

impl Derivation<InputAcquired> {
    /// Probe the source and plan every output.
    pub fn plan(
        self,
        backend: &dyn CodecBackend,
        estimator: Option<&dyn SizeEstimator>,
    ) -> Result<Derivation<PlanComputed>, DeriveError> {
        let meta = match (&self.state.bytes, &self.options.remote_image_metadata) {
            (Some(bytes), _) => {
                let probe = backend
                    .probe(bytes)
                    .map_err(|e| DeriveError::input(&self.source, e))?;
                SourceMetadata::from_probe(probe)
            }
            (None, Some(known)) => {
                SourceMetadata::from_dimensions(known.width, known.height, known.format)
            }
            (None, None) => {
                return Err(DeriveError::Configuration(format!(
                    "{}: no source bytes and no remote_image_metadata",
                    self.source.display_name()
                )));
            }
        };
        self.plan_with_metadata(meta, estimator)
    }

    /// Plan from already-known dimensions. Nothing is probed.
    pub fn plan_with_metadata(
        self,
        meta: SourceMetadata,
        estimator: Option<&dyn SizeEstimator>,
    ) -> Result<Derivation<PlanComputed>, DeriveError> {
        let source_size = match &self.state.bytes {
            Some(bytes) if meta.is_svg() => Some(svg_size(bytes, &self.options, estimator)?),
            _ => None,
        };
        let hash = if self.options.stats_only && self.options.hooks.url_format.is_some() {
            None
        } else {
            Some(self.content_hash(self.state.bytes.as_deref())?.to_string())
        };

        let src = self.source.display_name();
        let plan = build_plan(&meta, hash.as_deref(), &src, source_size, &self.options)?;
        debug!(
            src = %src,
            width = meta.width,
            height = meta.height,
            outputs = plan.len(),
            "planned derivation"
        );

        let bytes = self.state.bytes.clone();
        Ok(self.advance(PlanComputed { bytes, meta, plan }))
    }
}

impl Derivation<PlanComputed> {
    pub fn plan(&self) -> &FullStatsPlan {
        &self.state.plan
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.state.meta
    }

    /// The planned stats without producing anything.
    pub fn into_plan(self) -> FullStatsPlan {
        let mut plan = self.state.plan;
        if self.options.svg_short_circuit == SvgShortCircuit::Size {
            plan.apply_size_short_circuit();
        }
        plan
    }

    /// Produce every planned output.
    pub async fn materialize(
        self,
        backend: Arc<dyn CodecBackend>,
        estimator: Option<Arc<dyn SizeEstimator>>,
    ) -> Result<FullStatsPlan, DeriveError> {
        let src = self.source.display_name();
        let Some(bytes) = self.state.bytes else {
            return Err(DeriveError::Configuration(format!(
                "{src}: nothing to materialize without source bytes"
            )));
        };
        let order: Vec<_> = self.state.plan.formats().collect();
        let materializer = Arc::new(Materializer {
            source: bytes,
            meta: self.state.meta,
            options: Arc::clone(&self.options),
            backend,
            estimator,
        });

        let stats = try_join_all(self.state.plan.into_stats().into_iter().map(|stat| {
            let materializer = Arc::clone(&materializer);
            async move { materializer.materialize(stat).await }
        }))
        .await?;

        let mut plan = FullStatsPlan::from_stats(&order, stats);
        if self.options.svg_short_circuit == SvgShortCircuit::Size {
            plan.apply_size_short_circuit();
        }
        Ok(plan)
    }
}

/// Reported size of an SVG output.
pub(crate) fn svg_size(
    data: &[u8],
    options: &Options,
    estimator: Option<&dyn SizeEstimator>,
) -> Result<u64, DeriveError> {
    match options.svg_compression_size {
        SvgCompressionSize::Raw => Ok(data.len() as u64),
        SvgCompressionSize::Brotli => estimator.map(|e| e.estimate(data)).ok_or_else(|| {
            DeriveError::Configuration(
                "svg_compression_size = \"br\" requires a size estimator".into(),
            )
        }),
    }
}

/// Shared context for producing the outputs of one derivation.
struct Materializer {
    source: Bytes,
    meta: SourceMetadata,
    options: Arc<Options>,
    backend: Arc<dyn CodecBackend>,
    estimator: Option<Arc<dyn SizeEstimator>>,
}

impl Materializer {
    async fn materialize(&self, stat: Stat) -> Result<Stat, DeriveError> {
        if let Some(path) = stat.output_path.clone() {
            if self.options.use_cache && tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return self.reuse(stat, &path).await;
            }
        }

        let target = stat.url.clone();
        let params = plan_transcode(&stat, &self.meta, &self.options);
        let backend = Arc::clone(&self.backend);
        let options = Arc::clone(&self.options);
        let source = self.source.clone();
        let data = tokio::task::spawn_blocking(move || {
            produce(backend.as_ref(), &source, &params, &options.hooks)
        })
        .await
        .map_err(|e| DeriveError::materialization(&target, e))?
        .map_err(|e| DeriveError::materialization(&target, e))?;
        let data = Bytes::from(data);
        let size = self.size_of(&stat, &data)?;

        match &stat.output_path {
            Some(path) if !self.options.dry_run => {
                write_output(path, &data).await?;
                debug!(path = %path.display(), size, "wrote output");
                Ok(stat.materialized(size, None))
            }
            _ => {
                debug!(url = %stat.url, size, "produced output in memory");
                Ok(stat.materialized(size, Some(data)))
            }
        }
    }

    /// Reuse an output that already exists on disk.
    async fn reuse(&self, stat: Stat, path: &Path) -> Result<Stat, DeriveError> {
        debug!(path = %path.display(), "reusing existing output");
        let needs_bytes = self.options.dry_run
            || (stat.format.is_svg()
                && self.options.svg_compression_size == SvgCompressionSize::Brotli);
        if needs_bytes {
            let data = tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| DeriveError::materialization(path.display(), e))?;
            let size = self.size_of(&stat, &data)?;
            let buffer = self.options.dry_run.then_some(data);
            Ok(stat.materialized(size, buffer))
        } else {
            let size = tokio::fs::metadata(path)
                .await
                .map_err(|e| DeriveError::materialization(path.display(), e))?
                .len();
            Ok(stat.materialized(size, None))
        }
    }

    fn size_of(&self, stat: &Stat, data: &[u8]) -> Result<u64, DeriveError> {
        if stat.format.is_svg() {
            svg_size(data, &self.options, self.estimator.as_deref())
        } else {
            Ok(data.len() as u64)
        }
    }
}

async fn write_output(path: &Path, data: &[u8]) -> Result<(), DeriveError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DeriveError::materialization(parent.display(), e))?;
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| DeriveError::materialization(path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Hook, Hooks, RemoteCacheOptions, RemoteImageMetadata};
    use crate::format::{FormatRequest, ImageFormat, WidthRequest};
    use crate::imaging::backend::tests::MockBackend;
    use crate::remote::RemoteCache;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tempfile::TempDir;

    struct Len;

    impl SizeEstimator for Len {
        fn estimate(&self, data: &[u8]) -> u64 {
            data.len() as u64 / 2
        }
    }

    struct UnreachableCache;

    impl RemoteCache for UnreachableCache {
        fn fetch(
            &self,
            url: &str,
            _options: &RemoteCacheOptions,
        ) -> BoxFuture<'static, Result<Bytes, FetchError>> {
            let url = url.to_string();
            async move {
                Err(FetchError::Http {
                    url,
                    reason: "offline".into(),
                })
            }
            .boxed()
        }

        fn is_cache_valid(&self, _url: &str, _options: &RemoteCacheOptions) -> bool {
            false
        }
    }

    fn options_in(tmp: &TempDir, widths: &[u32], formats: &str) -> Options {
        Options {
            widths: widths.iter().copied().map(WidthRequest::Pixels).collect(),
            formats: FormatRequest::parse_list(formats).unwrap(),
            output_dir: tmp.path().join("out"),
            ..Options::default()
        }
    }

    fn planned(
        source: Source,
        options: Options,
        backend: &MockBackend,
    ) -> Derivation<PlanComputed> {
        Derivation::new(source, Arc::new(options))
            .acquire_sync()
            .unwrap()
            .plan(backend, None)
            .unwrap()
    }

    // =========================================================================
    // Error conversions
    // =========================================================================

    #[test]
    fn fetch_errors_name_the_url() {
        let err = DeriveError::from(FetchError::Status {
            url: "https://x.invalid/a.png".into(),
            status: 404,
        });
        assert_eq!(
            err,
            DeriveError::Input {
                src: "https://x.invalid/a.png".into(),
                reason: "HTTP 404 from https://x.invalid/a.png".into(),
            }
        );
        let err = DeriveError::from(FetchError::Duration("1x".into()));
        assert!(matches!(err, DeriveError::Configuration(_)));
    }

    #[test]
    fn unsupported_backend_input_is_format_error() {
        let err = DeriveError::from(BackendError::Unsupported("avif".into()));
        assert_eq!(err, DeriveError::UnsupportedFormat("avif".into()));
        let err = DeriveError::from(BackendError::ProcessingFailed("x".into()));
        assert!(matches!(err, DeriveError::Materialization { .. }));
    }

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn plan_probes_and_hashes_once() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::jpeg(1000, 500);
        let derivation = planned(
            Source::buffer(b"jpeg bytes".to_vec()),
            options_in(&tmp, &[250, 500], "webp,jpeg"),
            &backend,
        );
        let plan = derivation.plan();
        assert_eq!(plan.len(), 4);
        let hashes: Vec<_> = plan
            .stats()
            .map(|s| s.filename.as_deref().unwrap().split('-').next().unwrap().to_string())
            .collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(hashes[0].len(), 10);
        assert_eq!(backend.get_operations().len(), 1);
    }

    #[test]
    fn unprobeable_source_is_input_error() {
        let tmp = TempDir::new().unwrap();
        let backend = crate::imaging::RustBackend::new();
        let err = Derivation::new(
            Source::buffer(b"not an image".to_vec()),
            Arc::new(options_in(&tmp, &[10], "jpeg")),
        )
        .acquire_sync()
        .unwrap()
        .plan(&backend, None)
        .unwrap_err();
        assert!(matches!(err, DeriveError::Input { .. }));
    }

    #[test]
    fn missing_file_is_input_error() {
        let err = Derivation::new(Source::path("/nonexistent/x.png"), Arc::new(Options::default()))
            .acquire_sync()
            .unwrap_err();
        assert!(matches!(err, DeriveError::Input { .. }));
    }

    #[test]
    fn url_hook_skips_hash_for_stats_only() {
        let options = Options {
            stats_only: true,
            hooks: Hooks {
                url_format: Some(Hook::url_format("probe", |parts, _| {
                    format!("{}|{}", parts.hash.is_some(), parts.width)
                })),
                ..Hooks::default()
            },
            ..Options::default()
        };
        let derivation = planned(
            Source::buffer(b"img".to_vec()),
            Options {
                widths: vec![WidthRequest::Pixels(100)],
                formats: vec![FormatRequest::Format(ImageFormat::Png)],
                ..options
            },
            &MockBackend::jpeg(200, 100),
        );
        assert_eq!(derivation.plan().stats().next().unwrap().url, "false|100");
    }

    #[test]
    fn brotli_svg_size_needs_estimator() {
        let options = Options {
            svg_compression_size: SvgCompressionSize::Brotli,
            ..Options::default()
        };
        let err = svg_size(b"<svg/>", &options, None).unwrap_err();
        assert!(matches!(err, DeriveError::Configuration(_)));
        assert_eq!(svg_size(b"<svg></svg>", &options, Some(&Len)).unwrap(), 5);
        assert_eq!(svg_size(b"<svg/>", &Options::default(), None).unwrap(), 6);
    }

    #[tokio::test]
    async fn remote_stats_only_uses_known_metadata() {
        let options = Options {
            stats_only: true,
            widths: vec![WidthRequest::Pixels(400)],
            formats: vec![FormatRequest::Auto],
            remote_image_metadata: Some(RemoteImageMetadata {
                width: 800,
                height: 600,
                format: Some(ImageFormat::Png),
            }),
            ..Options::default()
        };
        let backend = MockBackend::jpeg(1, 1);
        let plan = Derivation::new(
            Source::remote("https://x.invalid/a.png", Arc::new(UnreachableCache)),
            Arc::new(options),
        )
        .acquire()
        .await
        .unwrap()
        .plan(&backend, None)
        .unwrap()
        .into_plan();
        let stat = &plan.get(ImageFormat::Png).unwrap()[0];
        assert_eq!((stat.width, stat.height), (400, 300));
        assert!(backend.get_operations().is_empty());
    }

    #[tokio::test]
    async fn remote_stats_only_without_metadata_is_config_error() {
        let options = Options {
            stats_only: true,
            ..Options::default()
        };
        let err = Derivation::new(
            Source::remote("https://x.invalid/a.png", Arc::new(UnreachableCache)),
            Arc::new(options),
        )
        .acquire()
        .await
        .unwrap_err();
        assert!(matches!(err, DeriveError::Configuration(_)));
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    #[tokio::test]
    async fn materialize_writes_every_output() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::jpeg(800, 400));
        let derivation = planned(
            Source::buffer(b"jpeg".to_vec()),
            options_in(&tmp, &[200, 400], "webp"),
            &backend,
        );
        let plan = derivation.materialize(backend.clone(), None).await.unwrap();

        let stats: Vec<_> = plan.stats().collect();
        assert_eq!(stats.len(), 2);
        for stat in &stats {
            let path = stat.output_path.as_ref().unwrap();
            assert_eq!(std::fs::read(path).unwrap().len() as u64, stat.size.unwrap());
            assert!(stat.buffer.is_none());
        }
        assert_eq!(stats[0].size, Some(400));
        assert_eq!(backend.transcode_count(), 2);
    }

    #[tokio::test]
    async fn dry_run_keeps_bytes_in_memory() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::jpeg(100, 100));
        let options = Options {
            dry_run: true,
            ..options_in(&tmp, &[50], "png")
        };
        let plan = planned(Source::buffer(b"j".to_vec()), options, &backend)
            .materialize(backend.clone(), None)
            .await
            .unwrap();
        let stat = plan.stats().next().unwrap();
        assert_eq!(stat.buffer.as_ref().map(|b| b.len()), Some(100));
        assert!(!stat.output_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn existing_output_is_reused() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::jpeg(100, 100));
        let options = options_in(&tmp, &[50], "png");
        let source = Source::buffer(b"j".to_vec());

        let first = planned(source.clone(), options.clone(), &backend)
            .materialize(backend.clone(), None)
            .await
            .unwrap();
        let path = first.stats().next().unwrap().output_path.clone().unwrap();
        std::fs::write(&path, b"abc").unwrap();

        let second = planned(source, options, &backend)
            .materialize(backend.clone(), None)
            .await
            .unwrap();
        assert_eq!(second.stats().next().unwrap().size, Some(3));
        assert_eq!(backend.transcode_count(), 1);
    }

    #[tokio::test]
    async fn cache_disabled_overwrites() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(MockBackend::jpeg(100, 100));
        let options = Options {
            use_cache: false,
            ..options_in(&tmp, &[50], "png")
        };
        let source = Source::buffer(b"j".to_vec());
        for _ in 0..2 {
            planned(source.clone(), options.clone(), &backend)
                .materialize(backend.clone(), None)
                .await
                .unwrap();
        }
        assert_eq!(backend.transcode_count(), 2);
    }

    #[tokio::test]
    async fn failed_transcode_is_materialization_error() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::jpeg(100, 100);
        let derivation = planned(
            Source::buffer(b"j".to_vec()),
            options_in(&tmp, &[50], "webp"),
            &backend,
        );
        let failing: Arc<dyn CodecBackend> = Arc::new(MockBackend::jpeg(100, 100).failing());
        let err = derivation.materialize(failing, None).await.unwrap_err();
        assert!(matches!(err, DeriveError::Materialization { .. }));
    }

    #[tokio::test]
    async fn url_hook_outputs_stay_in_memory() {
        let backend = Arc::new(MockBackend::jpeg(100, 100));
        let options = Options {
            widths: vec![WidthRequest::Pixels(40)],
            formats: vec![FormatRequest::Format(ImageFormat::Webp)],
            hooks: Hooks {
                url_format: Some(Hook::url_format("cdn", |parts, _| {
                    format!("https://cdn.invalid/{}", parts.width)
                })),
                ..Hooks::default()
            },
            ..Options::default()
        };
        let plan = planned(Source::buffer(b"j".to_vec()), options, &backend)
            .materialize(backend.clone(), None)
            .await
            .unwrap();
        let stat = plan.stats().next().unwrap();
        assert_eq!(stat.url, "https://cdn.invalid/40");
        assert_eq!(stat.size, Some(80));
        assert!(stat.buffer.is_some());
    }
}
