//! Deterministic naming of cached artifacts.
//!
//! A cached file name is a SHA-256 over the normalized request URL and the
//! output format, prefixed with [`CACHE_MARKER`] so a trim sweep can tell
//! generated artifacts apart from uploaded originals living in the same
//! storage. The key groups artifacts under the container of the content item
//! that owns the source image.

use crate::config::ImageFormat;
use sha2::{Digest, Sha256};

/// Prefix carried by every generated artifact name.
pub const CACHE_MARKER: &str = "ic~";

/// Container used when the source does not belong to a content item.
pub const STATIC_CONTAINER: &str = "_ic~static";

/// Bumped whenever the naming scheme changes so old artifacts stop matching.
const KEY_SCHEMA_VERSION: u32 = 1;

/// Normalize a request URL before hashing.
///
/// CMS version tokens (`,,123`) are dropped and every `?` after the first is
/// turned into `&`, so `/a.jpg,,42?w=1?h=2` and `/a.jpg?w=1&h=2` hash the same.
pub fn normalize_request_url(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut chars = url.chars().peekable();
    let mut seen_question = false;

    while let Some(c) = chars.next() {
        match c {
            ',' if chars.peek() == Some(&',') => {
                let mut lookahead = chars.clone();
                lookahead.next();
                if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    chars.next();
                    while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                        chars.next();
                    }
                } else {
                    out.push(c);
                }
            }
            '?' if seen_question => out.push('&'),
            '?' => {
                seen_question = true;
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Derive the cached file name for a request URL and output format.
pub fn cached_file_name(request_url: &str, format: ImageFormat) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_SCHEMA_VERSION.to_be_bytes());
    hasher.update(normalize_request_url(request_url).as_bytes());
    hasher.update([0u8]);
    hasher.update(format.extension().as_bytes());
    format!("{}{}.{}", CACHE_MARKER, hex::encode(hasher.finalize()), format.extension())
}

/// Build the cache key (and backend locator) for a cached file.
pub fn build_key(container: Option<&str>, cached_file_name: &str) -> String {
    let container = container
        .map(|c| c.trim_matches('/'))
        .filter(|c| !c.is_empty())
        .unwrap_or(STATIC_CONTAINER);
    format!("{}/{}", container, cached_file_name)
}

/// Split a key back into `(container, file name)`.
pub fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("", key))
}

/// True when the last segment of `locator` is a generated artifact.
pub fn is_cache_artifact(locator: &str) -> bool {
    split_key(locator).1.starts_with(CACHE_MARKER)
}
