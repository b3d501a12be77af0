//! Source descriptors.

use crate::config::Options;
use crate::format::ImageFormat;
use crate::hash::{HashInput, content_hash, url_safe_digest};
use crate::process::DeriveError;
use crate::remote::RemoteCache;
use bytes::Bytes;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A remote URL and the fetch cache it is retrieved through.
#[derive(Clone)]
pub struct RemoteSource {
    pub url: String,
    pub cache: Arc<dyn RemoteCache>,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Where a derivation reads its input from.
#[derive(Debug, Clone)]
pub enum Source {
    Path(PathBuf),
    Buffer(Bytes),
    Remote(RemoteSource),
}

impl Source {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Self::Buffer(bytes.into())
    }

    pub fn remote(url: impl Into<String>, cache: Arc<dyn RemoteCache>) -> Self {
        Self::Remote(RemoteSource {
            url: url.into(),
            cache,
        })
    }

    /// The source as shown to hooks and in logs.
    pub fn display_name(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Buffer(_) => "<buffer>".to_string(),
            Self::Remote(remote) => remote.url.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    fn is_svg_path(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("svg"))
    }

    /// Identity fields merged into the request signature.
    ///
    /// Only a file's metadata (or the remote cache's freshness record) is
    /// consulted; file content is never read here.
    pub(crate) fn identity(&self, options: &Options) -> Result<Map<String, Value>, DeriveError> {
        let mut fields = Map::new();
        fields.insert("__originalSrc".into(), self.display_name().into());
        match self {
            Self::Path(path) => {
                let meta = std::fs::metadata(path).map_err(|e| DeriveError::input(self, e))?;
                fields.insert("__originalSize".into(), meta.len().into());
            }
            Self::Buffer(bytes) => {
                fields.insert("__originalSize".into(), bytes.len().into());
                let digest = url_safe_digest(Sha256::digest(bytes).as_slice(), 43);
                fields.insert("__contentDigest".into(), digest.into());
            }
            Self::Remote(remote) => {
                let valid = remote.cache.is_cache_valid(&remote.url, &options.cache_options);
                fields.insert("__validAssetCache".into(), valid.into());
            }
        }
        Ok(fields)
    }

    /// Content hash for this source.
    ///
    /// `bytes` must be the source content for local sources; remote sources
    /// are hashed by URL and cache freshness.
    pub(crate) fn content_hash(&self, bytes: Option<&[u8]>, options: &Options) -> Result<String, DeriveError> {
        let input = match (self, bytes) {
            (Self::Remote(remote), _) => HashInput::Remote {
                url: &remote.url,
                valid_cache: remote.cache.is_cache_valid(&remote.url, &options.cache_options),
            },
            (Self::Path(path), Some(bytes)) => HashInput::Content {
                bytes,
                svg: Self::is_svg_path(path) || ImageFormat::sniff_svg(bytes),
            },
            (Self::Buffer(_), Some(bytes)) => HashInput::Content {
                bytes,
                svg: ImageFormat::sniff_svg(bytes),
            },
            (_, None) => {
                return Err(DeriveError::Configuration(format!(
                    "no content available to hash {}",
                    self.display_name()
                )));
            }
        };
        Ok(content_hash(input, &options.codec, options.hash_length))
    }

    /// Read local input. Remote sources yield `None`; they are never fetched
    /// synchronously.
    pub(crate) fn read_sync(&self) -> Result<Option<Bytes>, DeriveError> {
        match self {
            Self::Path(path) => std::fs::read(path)
                .map(|data| Some(Bytes::from(data)))
                .map_err(|e| DeriveError::input(self, e)),
            Self::Buffer(bytes) => Ok(Some(bytes.clone())),
            Self::Remote(_) => Ok(None),
        }
    }

    /// Read or fetch input.
    pub(crate) async fn read(&self, options: &Options) -> Result<Bytes, DeriveError> {
        match self {
            Self::Path(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| DeriveError::input(self, e)),
            Self::Buffer(bytes) => Ok(bytes.clone()),
            Self::Remote(remote) => remote
                .cache
                .fetch(&remote.url, &options.cache_options)
                .await
                .map_err(|e| DeriveError::input(self, e)),
        }
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Bytes> for Source {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for Source {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteCacheOptions;
    use crate::remote::FetchError;
    use futures::FutureExt;
    use futures::future::BoxFuture;

    struct FixedCache {
        valid: bool,
    }

    impl RemoteCache for FixedCache {
        fn fetch(
            &self,
            url: &str,
            _options: &RemoteCacheOptions,
        ) -> BoxFuture<'static, Result<Bytes, FetchError>> {
            let url = url.to_string();
            async move { Err(FetchError::Status { url, status: 404 }) }.boxed()
        }

        fn is_cache_valid(&self, _url: &str, _options: &RemoteCacheOptions) -> bool {
            self.valid
        }
    }

    #[test]
    fn path_identity_uses_file_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.jpg");
        std::fs::write(&path, b"12345").unwrap();
        let fields = Source::path(&path).identity(&Options::default()).unwrap();
        assert_eq!(fields["__originalSize"], 5);
        assert_eq!(fields["__originalSrc"], path.display().to_string());
    }

    #[test]
    fn missing_path_identity_is_input_error() {
        let err = Source::path("/nonexistent/a.jpg")
            .identity(&Options::default())
            .unwrap_err();
        assert!(matches!(err, DeriveError::Input { .. }));
    }

    #[test]
    fn buffer_identity_distinguishes_same_length_content() {
        let a = Source::buffer(b"aaaa".to_vec()).identity(&Options::default()).unwrap();
        let b = Source::buffer(b"bbbb".to_vec()).identity(&Options::default()).unwrap();
        assert_eq!(a["__originalSize"], b["__originalSize"]);
        assert_ne!(a["__contentDigest"], b["__contentDigest"]);
    }

    #[test]
    fn remote_identity_records_cache_validity() {
        let source = Source::remote("https://x.invalid/a.png", Arc::new(FixedCache { valid: true }));
        let fields = source.identity(&Options::default()).unwrap();
        assert_eq!(fields["__validAssetCache"], true);
        assert!(fields.get("__originalSize").is_none());
    }

    #[test]
    fn svg_path_hash_ignores_carriage_returns() {
        let options = Options::default();
        let source = Source::path("icon.svg");
        let lf = source.content_hash(Some(b"<g>\n</g>"), &options).unwrap();
        let crlf = source.content_hash(Some(b"<g>\r\n</g>"), &options).unwrap();
        assert_eq!(lf, crlf);
    }

    #[test]
    fn remote_hash_needs_no_bytes() {
        let source = Source::remote("https://x.invalid/a.png", Arc::new(FixedCache { valid: false }));
        let hash = source.content_hash(None, &Options::default()).unwrap();
        assert_eq!(hash.len(), 10);
    }

    #[test]
    fn read_sync_never_fetches_remote() {
        let source = Source::remote("https://x.invalid/a.png", Arc::new(FixedCache { valid: false }));
        assert!(source.read_sync().unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_fetch_is_input_error() {
        let source = Source::remote("https://x.invalid/a.png", Arc::new(FixedCache { valid: false }));
        let err = source.read(&Options::default()).await.unwrap_err();
        assert!(matches!(err, DeriveError::Input { .. }));
    }
}
