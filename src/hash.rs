//! Content hashing.
//!
//! Every output filename starts with a short id derived from what the source
//! *is*, not from what is asked of it:
//!
//! - **Local files and buffers**: SHA-256 of the bytes. SVG sources have
//!   `\r` removed first so a checkout with CRLF line endings produces the
//!   same names as one with LF.
//! - **Remote URLs**: SHA-256 of the URL followed by `ValidCache:true` or
//!   `ValidCache:false`, so a refetch after the fetch cache expired yields new
//!   names.
//!
//! The canonical JSON of [`CodecOptions`] is appended in both cases: changing
//! a quality setting renames every output, while changing widths, formats or
//! output locations does not.
//!
//! The digest is base64-encoded with `=`, `+` and `/` removed, leaving only
//! characters that are safe in paths and URLs, and truncated to
//! `hash_length`.

use crate::imaging::params::CodecOptions;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// What the hash is computed over.
#[derive(Debug, Clone, Copy)]
pub enum HashInput<'a> {
    Content { bytes: &'a [u8], svg: bool },
    Remote { url: &'a str, valid_cache: bool },
}

/// Short content id for one source under one set of codec options.
pub fn content_hash(input: HashInput<'_>, codec: &CodecOptions, length: usize) -> String {
    let mut hasher = Sha256::new();
    match input {
        HashInput::Content { bytes, svg: true } => {
            let normalized: Vec<u8> = bytes.iter().copied().filter(|&b| b != b'\r').collect();
            hasher.update(&normalized);
        }
        HashInput::Content { bytes, svg: false } => hasher.update(bytes),
        HashInput::Remote { url, valid_cache } => {
            hasher.update(url.as_bytes());
            hasher.update(format!("ValidCache:{valid_cache}").as_bytes());
        }
    }
    hasher.update(to_canonical_json(codec).as_bytes());
    url_safe_digest(hasher.finalize().as_slice(), length)
}

/// Base64 of `digest` with `=`, `+`, `/` dropped, truncated to `length` chars.
pub fn url_safe_digest(digest: &[u8], length: usize) -> String {
    STANDARD
        .encode(digest)
        .chars()
        .filter(|c| !matches!(c, '=' | '+' | '/'))
        .take(length)
        .collect()
}

/// Serialize `value` as JSON with object keys sorted at every level.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(value) => canonical_json(&value),
        // Only non-string map keys fail here; none of our types have them.
        Err(_) => String::new(),
    }
}

/// Render a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value.clone()).to_string()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
