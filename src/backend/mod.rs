// Storage backends
pub mod cloud;
pub mod embedded;
pub mod fs;

pub use cloud::CloudBackend;
pub use embedded::EmbeddedBackend;
pub use fs::FsBackend;

use crate::config::BackendSettings;
use crate::probe::parse_http_date;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::HeaderMap;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status} for {locator}")]
    Status { status: u16, locator: String },
    #[error("embedded store error: {0}")]
    Embedded(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

impl From<sled::Error> for BackendError {
    fn from(e: sled::Error) -> Self {
        BackendError::Embedded(e.to_string())
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Metadata the backend keeps for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub locator: String,
    pub last_modified: OffsetDateTime,
    pub content_type: Option<String>,
    pub size: u64,
    pub etag: Option<String>,
}

/// Properties attached to a blob on write.
#[derive(Debug, Clone, Default)]
pub struct WriteProps {
    pub content_type: String,
    pub cache_control: Option<String>,
    /// Provenance tag (tool name and version).
    pub processed_by: Option<String>,
}

/// Conditional-request validators forwarded from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<OffsetDateTime>,
    pub cache_control: Option<String>,
}

impl Conditions {
    /// Pick validators out of request headers.
    ///
    /// An unparseable `If-Modified-Since` is dropped and the request proceeds
    /// as unconditional.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: http::header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let if_modified_since = header(http::header::IF_MODIFIED_SINCE).and_then(|raw| {
            let parsed = parse_http_date(&raw);
            if parsed.is_none() {
                tracing::warn!(value = %raw, "Ignoring unparseable If-Modified-Since");
            }
            parsed
        });

        Self {
            if_none_match: header(http::header::IF_NONE_MATCH),
            if_modified_since,
            cache_control: header(http::header::CACHE_CONTROL),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }

    /// Evaluate the validators against stored metadata.
    ///
    /// `If-None-Match` wins over `If-Modified-Since` when both are present.
    pub fn not_modified(&self, meta: &BlobMeta) -> bool {
        if let Some(inm) = &self.if_none_match {
            return meta.etag.as_deref().is_some_and(|etag| etag_matches(inm, etag));
        }
        if let Some(since) = self.if_modified_since {
            return meta.last_modified.unix_timestamp() <= since.unix_timestamp();
        }
        false
    }
}

/// Weak comparison of an `If-None-Match` list against an entity tag.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let strip = |t: &str| t.trim().trim_start_matches("W/").to_string();
    let etag = strip(etag);
    if_none_match
        .split(',')
        .any(|candidate| candidate.trim() == "*" || strip(candidate) == etag)
}

pub enum ReadOutcome {
    NotFound,
    NotModified(BlobMeta),
    Content { meta: BlobMeta, body: ByteStream },
}

impl std::fmt::Debug for ReadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadOutcome::NotFound => write!(f, "NotFound"),
            ReadOutcome::NotModified(meta) => f.debug_tuple("NotModified").field(meta).finish(),
            ReadOutcome::Content { meta, .. } => f.debug_struct("Content").field("meta", meta).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    NotFound,
    NotModified(BlobMeta),
    Present(BlobMeta),
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<BlobMeta>,
    /// Pass back as `marker` to fetch the next page; `None` on the last page.
    pub next_marker: Option<String>,
}

/// Capability set every storage backend provides.
///
/// Locators are opaque `container/file` strings; backends only promise they
/// are stable and comparable for equality.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Existence plus metadata in one call; `None` when absent.
    async fn metadata(&self, locator: &str) -> BackendResult<Option<BlobMeta>>;

    async fn exists(&self, locator: &str) -> BackendResult<bool> {
        Ok(self.metadata(locator).await?.is_some())
    }

    /// Conditional check without transferring bytes.
    async fn probe(&self, locator: &str, conditions: &Conditions) -> BackendResult<ProbeOutcome> {
        Ok(match self.metadata(locator).await? {
            None => ProbeOutcome::NotFound,
            Some(meta) if conditions.not_modified(&meta) => ProbeOutcome::NotModified(meta),
            Some(meta) => ProbeOutcome::Present(meta),
        })
    }

    /// Conditional read; the body is streamed.
    async fn read(&self, locator: &str, conditions: &Conditions) -> BackendResult<ReadOutcome>;

    /// Overwrite (or create) a blob. Last write wins.
    async fn write(&self, locator: &str, data: Bytes, props: &WriteProps) -> BackendResult<()>;

    /// One page of blobs under `prefix`, ordered by locator, starting after `marker`.
    async fn list(&self, prefix: &str, marker: Option<&str>, limit: usize) -> BackendResult<ListPage>;

    /// Delete a blob; deleting something already gone is not an error.
    async fn delete(&self, locator: &str) -> BackendResult<()>;
}

/// Reject empty, absolute or traversing locators.
pub fn validate_locator(locator: &str) -> BackendResult<&str> {
    let bad = locator.is_empty()
        || locator.starts_with('/')
        || locator.contains('\\')
        || locator.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(BackendError::InvalidLocator(locator.to_string()));
    }
    Ok(locator)
}

/// Read a whole body into memory.
pub async fn collect_body(body: ByteStream) -> BackendResult<Bytes> {
    use futures::TryStreamExt;
    let chunks: Vec<Bytes> = body.try_collect().await?;
    Ok(Bytes::from(chunks.concat()))
}

/// The backend chosen by configuration.
///
/// Delegates every call to the concrete variant, so the adapter is written
/// once against [`StorageBackend`].
pub enum ConfiguredBackend {
    Fs(FsBackend),
    Cloud(CloudBackend),
    Embedded(EmbeddedBackend),
}

impl ConfiguredBackend {
    /// Construct the backend handle once at startup.
    pub async fn open(settings: &BackendSettings, timeout: Duration) -> BackendResult<Self> {
        let backend = match settings {
            BackendSettings::Fs { root } => ConfiguredBackend::Fs(FsBackend::open(root.clone()).await?),
            BackendSettings::Cloud(cloud) => ConfiguredBackend::Cloud(CloudBackend::new(cloud.clone(), timeout)?),
            BackendSettings::Embedded { path } => ConfiguredBackend::Embedded(EmbeddedBackend::open(path)?),
        };
        tracing::info!(backend = backend.name(), "Storage backend ready");
        Ok(backend)
    }

    fn inner(&self) -> &dyn StorageBackend {
        match self {
            ConfiguredBackend::Fs(b) => b,
            ConfiguredBackend::Cloud(b) => b,
            ConfiguredBackend::Embedded(b) => b,
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for ConfiguredBackend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    async fn metadata(&self, locator: &str) -> BackendResult<Option<BlobMeta>> {
        self.inner().metadata(locator).await
    }

    async fn exists(&self, locator: &str) -> BackendResult<bool> {
        self.inner().exists(locator).await
    }

    async fn probe(&self, locator: &str, conditions: &Conditions) -> BackendResult<ProbeOutcome> {
        self.inner().probe(locator, conditions).await
    }

    async fn read(&self, locator: &str, conditions: &Conditions) -> BackendResult<ReadOutcome> {
        self.inner().read(locator, conditions).await
    }

    async fn write(&self, locator: &str, data: Bytes, props: &WriteProps) -> BackendResult<()> {
        self.inner().write(locator, data, props).await
    }

    async fn list(&self, prefix: &str, marker: Option<&str>, limit: usize) -> BackendResult<ListPage> {
        self.inner().list(prefix, marker, limit).await
    }

    async fn delete(&self, locator: &str) -> BackendResult<()> {
        self.inner().delete(locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn meta(etag: Option<&str>, ts: i64) -> BlobMeta {
        BlobMeta {
            locator: "c/ic~a.jpg".into(),
            last_modified: OffsetDateTime::from_unix_timestamp(ts).unwrap(),
            content_type: Some("image/jpeg".into()),
            size: 3,
            etag: etag.map(str::to_string),
        }
    }

    #[test]
    fn locator_validation() {
        assert!(validate_locator("c/ic~a.jpg").is_ok());
        assert!(validate_locator("").is_err());
        assert!(validate_locator("/c/a.jpg").is_err());
        assert!(validate_locator("c/../a.jpg").is_err());
        assert!(validate_locator("c//a.jpg").is_err());
        assert!(validate_locator("c\\a.jpg").is_err());
    }

    #[test]
    fn if_none_match_takes_precedence() {
        let c = Conditions {
            if_none_match: Some("\"other\"".into()),
            if_modified_since: Some(OffsetDateTime::from_unix_timestamp(2_000).unwrap()),
            cache_control: None,
        };
        assert!(!c.not_modified(&meta(Some("\"abc\""), 1_000)));

        let c = Conditions { if_none_match: Some("W/\"abc\", \"x\"".into()), ..Default::default() };
        assert!(c.not_modified(&meta(Some("\"abc\""), 1_000)));
    }

    #[test]
    fn if_modified_since_compares_seconds() {
        let c = Conditions {
            if_modified_since: Some(OffsetDateTime::from_unix_timestamp(1_000).unwrap()),
            ..Default::default()
        };
        assert!(c.not_modified(&meta(None, 1_000)));
        assert!(!c.not_modified(&meta(None, 1_001)));
    }

    #[test]
    fn conditions_from_headers_ignore_garbage_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::IF_MODIFIED_SINCE, HeaderValue::from_static("yesterday-ish"));
        headers.insert(http::header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        let c = Conditions::from_headers(&headers);
        assert_eq!(c.if_modified_since, None);
        assert_eq!(c.if_none_match.as_deref(), Some("\"abc\""));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 27 Nov 2016 20:01:45 UTC"),
        );
        let c = Conditions::from_headers(&headers);
        assert_eq!(c.if_modified_since.unwrap().unix_timestamp(), 1_480_276_905);
    }
}
