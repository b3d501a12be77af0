//! Remote source fetching with an on-disk freshness cache.
//!
//! [`RemoteCache`] is the seam the pipeline fetches remote sources through;
//! [`HttpAssetCache`] is the default implementation.
//!
//! ## Cache layout
//!
//! Each URL maps to two files under `cache_options.directory`, named by a
//! digest of the URL:
//!
//! ```text
//! .cache/
//! ├── remote-3f2a9c1e7b4d8a06        # response body
//! └── remote-3f2a9c1e7b4d8a06.json   # {"url": "...", "cached_at": 1760000000}
//! ```
//!
//! A cached body is *fresh* while `now - cached_at` is below the configured
//! duration (`"30s"`, `"10m"`, `"4h"`, `"1d"`, `"2w"`, `"1y"`; `"*"` never
//! expires). Freshness also feeds the content hash of remote sources, so
//! refetching after expiry produces new output names.

use crate::config::RemoteCacheOptions;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str = concat!("responsive-images/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("cache I/O error: {0}")]
    Io(String),
    #[error("invalid cache duration: {0:?}")]
    Duration(String),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Fetches remote sources, de-duplicating concurrent fetches of one URL.
pub trait RemoteCache: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        options: &RemoteCacheOptions,
    ) -> BoxFuture<'static, Result<Bytes, FetchError>>;

    /// Whether a fresh copy of `url` is cached. Never touches the network.
    fn is_cache_valid(&self, url: &str, options: &RemoteCacheOptions) -> bool;
}

/// Parse a cache duration. `Ok(None)` means "never expires".
pub fn parse_duration(spec: &str) -> Result<Option<Duration>, FetchError> {
    let spec = spec.trim();
    if spec == "*" {
        return Ok(None);
    }
    let invalid = || FetchError::Duration(spec.to_string());
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = spec.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        "y" => 365 * 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    Ok(Some(Duration::from_secs(amount.saturating_mul(seconds))))
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    url: String,
    cached_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cache_paths(directory: &Path, url: &str) -> (PathBuf, PathBuf) {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    let stem = format!("remote-{}", &digest[..16]);
    (
        directory.join(&stem),
        directory.join(format!("{stem}.json")),
    )
}

fn is_fresh(url: &str, options: &RemoteCacheOptions) -> bool {
    let (body_path, meta_path) = cache_paths(&options.directory, url);
    let Ok(raw) = std::fs::read(&meta_path) else {
        return false;
    };
    let Ok(meta) = serde_json::from_slice::<CacheMeta>(&raw) else {
        return false;
    };
    if meta.url != url || !body_path.exists() {
        return false;
    }
    match parse_duration(&options.duration) {
        Ok(None) => true,
        Ok(Some(max_age)) => now_secs().saturating_sub(meta.cached_at) < max_age.as_secs(),
        Err(e) => {
            warn!(error = %e, "treating remote cache entry as stale");
            false
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, FetchError>>>;

struct Inner {
    client: reqwest::Client,
    inflight: Mutex<HashMap<String, SharedFetch>>,
}

impl Inner {
    fn forget(&self, url: &str) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }
}

/// HTTP fetcher backed by the on-disk cache described in the [module docs](self).
#[derive(Clone)]
pub struct HttpAssetCache {
    inner: Arc<Inner>,
}

impl HttpAssetCache {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Http {
                url: String::new(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }
}

async fn fetch_through_cache(
    client: &reqwest::Client,
    url: &str,
    options: &RemoteCacheOptions,
) -> Result<Bytes, FetchError> {
    let (body_path, meta_path) = cache_paths(&options.directory, url);

    if is_fresh(url, options) {
        match tokio::fs::read(&body_path).await {
            Ok(body) => {
                debug!(url, "remote cache hit");
                return Ok(Bytes::from(body));
            }
            Err(e) => debug!(url, error = %e, "cached body unreadable, refetching"),
        }
    }

    debug!(url, "fetching remote source");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::Http {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let body = response.bytes().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    tokio::fs::create_dir_all(&options.directory).await?;
    tokio::fs::write(&body_path, &body).await?;
    let meta = serde_json::to_vec(&CacheMeta {
        url: url.to_string(),
        cached_at: now_secs(),
    })
    .map_err(|e| FetchError::Io(e.to_string()))?;
    tokio::fs::write(&meta_path, meta).await?;
    Ok(body)
}

impl RemoteCache for HttpAssetCache {
    fn fetch(
        &self,
        url: &str,
        options: &RemoteCacheOptions,
    ) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let mut inflight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inflight.get(url) {
            debug!(url, "joining in-flight fetch");
            return existing.clone().boxed();
        }

        let inner = Arc::clone(&self.inner);
        let owned_url = url.to_string();
        let options = options.clone();
        let job = async move {
            let result = fetch_through_cache(&inner.client, &owned_url, &options).await;
            inner.forget(&owned_url);
            result
        }
        .boxed()
        .shared();
        inflight.insert(url.to_string(), job.clone());
        job.boxed()
    }

    fn is_cache_valid(&self, url: &str, options: &RemoteCacheOptions) -> bool {
        is_fresh(url, options)
    }
}
