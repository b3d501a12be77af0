//! Request deduplication.
//!
//! Deriving the same image twice with the same options is wasted work, and
//! in a site build the same asset is often referenced from many pages at
//! once. Every request is reduced to a *signature*; the first request with a
//! given signature starts a job, and every later request with the same
//! signature awaits that same job instead of starting another.
//!
//! # Signatures
//!
//! A signature is the canonical JSON (keys sorted at every level) of:
//!
//! - every serializable [`Options`] field except `concurrency`, which affects
//!   scheduling but never output;
//! - the hooks, each reduced to `"<fn>{name}"`;
//! - the source identity: `__originalSrc` plus `__originalSize` (files and
//!   buffers), `__contentDigest` (buffers) or `__validAssetCache` (remote).
//!
//! Only file metadata is consulted for paths: a file rewritten in place with
//! exactly the same length keeps its signature for the life of the process.
//!
//! # Lifetime
//!
//! Entries live as long as the cache. A job that fails is evicted by its
//! owner so a later identical request retries; successful jobs are never
//! evicted, and their shared result is handed to every caller.

use crate::config::Options;
use crate::hash::canonical_json;
use crate::process::DeriveError;
use crate::source::Source;
use crate::types::FullStatsPlan;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A derivation job whose result every waiting caller receives a clone of.
pub type SharedJob = Shared<BoxFuture<'static, Result<FullStatsPlan, DeriveError>>>;

/// Signature → in-flight or completed job.
#[derive(Default)]
pub struct DedupCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, SharedJob>,
    stats: DedupStats,
}

impl fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("DedupCache")
            .field("entries", &inner.jobs.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, signature: &str) -> Option<SharedJob> {
        self.lock().jobs.get(signature).cloned()
    }

    pub fn put(&self, signature: impl Into<String>, job: SharedJob) {
        self.lock().jobs.insert(signature.into(), job);
    }

    /// The job registered under `signature`, or a new one from `start`.
    ///
    /// `start` runs while the cache is locked, so two concurrent callers can
    /// never both start a job for one signature. The flag is `true` when the
    /// job was started by this call.
    pub fn get_or_insert_with(
        &self,
        signature: &str,
        start: impl FnOnce() -> SharedJob,
    ) -> (SharedJob, bool) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get(signature).cloned() {
            inner.stats.coalesced += 1;
            return (job, false);
        }
        let job = start();
        inner.jobs.insert(signature.to_string(), job.clone());
        inner.stats.derived += 1;
        (job, true)
    }

    /// Forget a signature. Returns whether it was present.
    pub fn evict(&self, signature: &str) -> bool {
        self.lock().jobs.remove(signature).is_some()
    }

    pub fn clear(&self) {
        self.lock().jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DedupStats {
        self.lock().stats
    }
}

/// Signature for one request.
///
/// Fails only when the source identity cannot be read, e.g. a missing file.
pub fn request_signature(source: &Source, options: &Options) -> Result<String, DeriveError> {
    let mut fields = match serde_json::to_value(options) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => serde_json::Map::new(),
        Err(e) => return Err(DeriveError::Configuration(e.to_string())),
    };
    fields.remove("concurrency");
    fields.insert("hooks".into(), options.hooks.signature_value());
    fields.extend(source.identity(options)?);
    Ok(canonical_json(&Value::Object(fields)))
}

/// Summary of deduplication for a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    /// Requests that started a job.
    pub derived: u32,
    /// Requests that joined an existing job.
    pub coalesced: u32,
}

impl DedupStats {
    pub fn total(&self) -> u32 {
        self.derived + self.coalesced
    }
}

impl fmt::Display for DedupStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coalesced > 0 {
            write!(
                f,
                "{} derived, {} coalesced ({} total)",
                self.derived,
                self.coalesced,
                self.total()
            )
        } else {
            write!(f, "{} derived", self.derived)
        }
    }
}
