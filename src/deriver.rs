//! The derivation service.
//!
//! A [`Deriver`] owns everything that is shared between requests: the codec
//! backend, the optional SVG size estimator, the [`JobQueue`] bounding how
//! many derivations run at once, and the [`DedupCache`] coalescing identical
//! requests. Tests and embedders build their own; the crate-level functions
//! use a process-wide default backed by [`RustBackend`].
//!
//! ```text
//! derive(source, options)
//!   ├─ validate options, apply options.concurrency to the queue
//!   ├─ signature = request_signature(source, options)
//!   └─ cache.get_or_insert_with(signature)
//!        ├─ hit:  await the existing job
//!        └─ miss: spawn job → queue.run(acquire → plan → materialize)
//!                 failure evicts the signature
//! ```

use crate::cache::{DedupCache, SharedJob, request_signature};
use crate::config::Options;
use crate::imaging::backend::{CodecBackend, SizeEstimator};
use crate::imaging::rust_backend::RustBackend;
use crate::process::{Derivation, DeriveError};
use crate::queue::JobQueue;
use crate::source::Source;
use crate::types::{FullStatsPlan, SourceMetadata};
use futures::FutureExt;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

static GLOBAL: OnceLock<Deriver> = OnceLock::new();

pub struct Deriver {
    backend: Arc<dyn CodecBackend>,
    estimator: Option<Arc<dyn SizeEstimator>>,
    queue: JobQueue,
    cache: Arc<DedupCache>,
}

impl fmt::Debug for Deriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deriver")
            .field("queue", &self.queue)
            .field("cache", &self.cache)
            .field("estimator", &self.estimator.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Deriver {
    fn default() -> Self {
        Self::new(Arc::new(RustBackend::new()))
    }
}

impl Deriver {
    pub fn new(backend: Arc<dyn CodecBackend>) -> Self {
        Self {
            backend,
            estimator: None,
            queue: JobQueue::default(),
            cache: Arc::new(DedupCache::new()),
        }
    }

    /// Enable `svg_compression_size = "br"`.
    pub fn with_estimator(mut self, estimator: Arc<dyn SizeEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_concurrency(self, limit: usize) -> Self {
        self.queue.set_limit(limit);
        self
    }

    /// The process-wide default.
    pub fn global() -> &'static Deriver {
        GLOBAL.get_or_init(Deriver::default)
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.queue.limit()
    }

    pub fn set_concurrency(&self, limit: usize) {
        self.queue.set_limit(limit);
    }

    /// Run the full pipeline for one source.
    ///
    /// Identical concurrent requests share one job. Under `stats_only` the
    /// plan is returned without producing any output.
    pub async fn derive(
        &self,
        source: impl Into<Source>,
        options: Options,
    ) -> Result<FullStatsPlan, DeriveError> {
        options.validate()?;
        if let Some(limit) = options.concurrency {
            self.set_concurrency(limit);
        }
        let source = source.into();
        let signature = request_signature(&source, &options)?;

        let (job, started) = self.cache.get_or_insert_with(&signature, || {
            self.start(source.clone(), options, signature.clone())
        });
        if !started {
            debug!(src = %source.display_name(), "joining in-flight derivation");
        }
        job.await
    }

    /// Spawn the job for a new signature.
    ///
    /// The job runs to completion even if every caller stops waiting.
    fn start(&self, source: Source, options: Options, signature: String) -> SharedJob {
        let queue = self.queue.clone();
        let cache = Arc::clone(&self.cache);
        let backend = Arc::clone(&self.backend);
        let estimator = self.estimator.clone();
        let src = source.display_name();

        let handle = tokio::spawn({
            let cache = Arc::clone(&cache);
            let signature = signature.clone();
            let src = src.clone();
            async move {
                let result = queue
                    .run(run_pipeline(source, Arc::new(options), backend, estimator))
                    .await;
                match &result {
                    Ok(plan) => info!(src = %src, outputs = plan.len(), "derived"),
                    Err(e) => {
                        cache.evict(&signature);
                        warn!(src = %src, error = %e, "derivation failed");
                    }
                }
                result
            }
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    cache.evict(&signature);
                    Err(DeriveError::materialization(src, e))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Plan without writing anything, reading local input synchronously.
    ///
    /// Produces the same stats (URLs included) that [`derive`](Self::derive)
    /// would for the same source and options. Remote sources cannot be read
    /// synchronously and are rejected.
    pub fn stats_sync(
        &self,
        source: impl Into<Source>,
        options: Options,
    ) -> Result<FullStatsPlan, DeriveError> {
        options.validate()?;
        let source = source.into();
        if source.is_remote() {
            return Err(DeriveError::Configuration(format!(
                "{}: remote sources cannot be planned synchronously",
                source.display_name()
            )));
        }
        Ok(Derivation::new(source, Arc::new(options))
            .acquire_sync()?
            .plan(self.backend.as_ref(), self.estimator.as_deref())?
            .into_plan())
    }

    /// Plan from caller-supplied native dimensions. Nothing is probed.
    ///
    /// The native format is unknown, so `auto` in `formats` fails with
    /// [`DeriveError::UnsupportedFormat`].
    pub fn stats_by_dimensions_sync(
        &self,
        source: impl Into<Source>,
        width: u32,
        height: u32,
        options: Options,
    ) -> Result<FullStatsPlan, DeriveError> {
        options.validate()?;
        if width == 0 || height == 0 {
            return Err(DeriveError::Configuration(format!(
                "native dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let meta = SourceMetadata::from_dimensions(width, height, None);
        Ok(Derivation::new(source.into(), Arc::new(options))
            .acquire_sync()?
            .plan_with_metadata(meta, self.estimator.as_deref())?
            .into_plan())
    }
}

async fn run_pipeline(
    source: Source,
    options: Arc<Options>,
    backend: Arc<dyn CodecBackend>,
    estimator: Option<Arc<dyn SizeEstimator>>,
) -> Result<FullStatsPlan, DeriveError> {
    let stats_only = options.stats_only;
    let planned = Derivation::new(source, options)
        .acquire()
        .await?
        .plan(backend.as_ref(), estimator.as_deref())?;
    if stats_only {
        return Ok(planned.into_plan());
    }
    planned.materialize(backend, estimator).await
}
