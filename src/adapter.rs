//! The image cache adapter.
//!
//! One [`ImageCache`] is built at startup around a storage backend and shared
//! by every request. Each request gets a [`CacheRequest`] that walks the
//! `Unchecked → Fresh | Stale | Missing` state machine:
//!
//! 1. [`CacheRequest::check_freshness`] looks the artifact up in the soft
//!    index, falls back to backend metadata, and evicts it when it is older
//!    than `max_age` or its source changed since it was written.
//! 2. When stale or missing, the caller renders the image and hands the bytes
//!    to [`CacheRequest::store_artifact`].
//! 3. When fresh, [`CacheRequest::rewrite`] answers the request from the
//!    cached bytes, either by redirecting to a public URL or by streaming them.
//!
//! [`ImageCache::trim`] is the out-of-band sweep that deletes expired
//! artifacts.

use crate::backend::{BackendError, BlobMeta, Conditions, ProbeOutcome, ReadOutcome, StorageBackend, WriteProps};
use crate::config::{CacheSettings, ImageFormat};
use crate::headers::{processed_by, set_standard_headers, CacheControlPolicy};
use crate::index::{CacheIndex, CachedArtifact, MemoryIndex};
use crate::key::{build_key, cached_file_name, is_cache_artifact, split_key};
use crate::metrics::Metrics;
use crate::probe::{SourceLocation, SourceProbe};
use crate::signature::UrlSigner;
use crate::Result;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Artifacts younger than this get a weak ETag; their timestamp may still move.
const WEAK_ETAG_WINDOW_SECS: i64 = 3;

/// What the pipeline knows about the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Path as requested, e.g. `/media/3f2a/photo.jpg`.
    pub request_path: String,
    /// Transform query string without the leading `?`.
    pub query: String,
    pub source: SourceLocation,
    /// Output format of the artifact.
    pub format: ImageFormat,
}

impl RequestContext {
    /// Path and query, the input to cached file naming.
    pub fn request_url(&self) -> String {
        if self.query.is_empty() {
            self.request_path.clone()
        } else {
            format!("{}?{}", self.request_path, self.query)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Unchecked,
    Fresh,
    Stale,
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrimReport {
    pub examined: u64,
    pub deleted: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// Entity tag for an artifact created at `created_at`.
pub fn artifact_etag(created_at: OffsetDateTime, now: OffsetDateTime) -> String {
    let tag = format!("\"{:x}\"", created_at.unix_timestamp());
    if now - created_at < time::Duration::seconds(WEAK_ETAG_WINDOW_SECS) {
        format!("W/{}", tag)
    } else {
        tag
    }
}

/// Shared cache adapter over one storage backend.
pub struct ImageCache<B: StorageBackend> {
    backend: Arc<B>,
    index: Arc<dyn CacheIndex>,
    settings: CacheSettings,
    probe: SourceProbe,
    signer: Option<UrlSigner>,
    metrics: Arc<Metrics>,
}

impl<B: StorageBackend> ImageCache<B> {
    pub fn new(backend: Arc<B>, settings: CacheSettings, client: reqwest::Client) -> Self {
        let probe = SourceProbe::new(client, settings.cdn_timeout);
        let signer = settings.signing_key.as_deref().map(UrlSigner::new);
        Self {
            backend,
            index: Arc::new(MemoryIndex::new()),
            settings,
            probe,
            signer,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn CacheIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn index(&self) -> &Arc<dyn CacheIndex> {
        &self.index
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn signer(&self) -> Option<&UrlSigner> {
        self.signer.as_ref()
    }

    /// Start tracking one request. `container` is the owning content item's
    /// storage segment, `None` for static files.
    pub fn request(&self, ctx: RequestContext, container: Option<&str>) -> CacheRequest<'_, B> {
        let file = cached_file_name(&ctx.request_url(), ctx.format);
        let key = build_key(container, &file);
        CacheRequest {
            cache: self,
            ctx,
            key,
            state: CacheState::Unchecked,
            artifact: None,
        }
    }

    fn is_expired(&self, created_at: OffsetDateTime, now: OffsetDateTime) -> bool {
        match time::Duration::try_from(self.settings.max_age) {
            Ok(max_age) => now - created_at > max_age,
            Err(_) => false,
        }
    }

    fn policy(&self) -> CacheControlPolicy {
        CacheControlPolicy::for_images(self.settings.browser_max_days)
    }

    /// Delete expired artifacts from the backend and the index.
    ///
    /// Cancellation is checked before every page and every delete. A listing
    /// failure ends the sweep; a delete failure is logged and skipped.
    pub async fn trim(&self, cancel: &CancellationToken) -> TrimReport {
        let prefix = self.settings.trim_prefix.as_deref().unwrap_or("");
        let page_size = self.settings.trim_page_size;
        let now = OffsetDateTime::now_utc();
        let mut report = TrimReport::default();
        let mut marker: Option<String> = None;

        tracing::info!(backend = self.backend.name(), prefix, "Starting cache trim");

        'pages: loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let page = match self.backend.list(prefix, marker.as_deref(), page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(prefix, error = %e, "Trim listing failed");
                    report.failed += 1;
                    break;
                }
            };

            for item in page.items {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'pages;
                }
                report.examined += 1;
                if !is_cache_artifact(&item.locator) || !self.is_expired(item.last_modified, now) {
                    continue;
                }

                self.index.remove(&item.locator);
                match self.backend.delete(&item.locator).await {
                    Ok(()) => {
                        report.deleted += 1;
                        Metrics::incr(&self.metrics.trimmed);
                    }
                    Err(e) => {
                        tracing::warn!(locator = %item.locator, error = %e, "Unable to delete expired artifact");
                        report.failed += 1;
                    }
                }
            }

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        let purged = self.index.purge_expired();
        tracing::info!(
            purged,
            examined = report.examined,
            deleted = report.deleted,
            failed = report.failed,
            cancelled = report.cancelled,
            "Cache trim finished"
        );
        report
    }
}

/// Per-request view of the cache.
pub struct CacheRequest<'a, B: StorageBackend> {
    cache: &'a ImageCache<B>,
    ctx: RequestContext,
    key: String,
    state: CacheState,
    artifact: Option<CachedArtifact>,
}

impl<'a, B: StorageBackend> CacheRequest<'a, B> {
    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Backend locator of the artifact. Keys double as locators.
    pub fn locator(&self) -> &str {
        &self.key
    }

    /// Creation time of the artifact once it is known fresh.
    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.artifact.as_ref().map(|a| a.created_at)
    }

    /// Public, unsigned address of the artifact.
    pub fn cached_path(&self) -> String {
        format!("{}/{}", self.cache.settings.public_root, self.key)
    }

    /// Where redirect mode sends clients: the CDN when one is configured,
    /// otherwise the (signed) public address.
    pub fn redirect_target(&self) -> String {
        match &self.cache.settings.cdn_root {
            Some(cdn) => {
                let (container, _) = split_key(&self.key);
                if self.cache.settings.use_cached_container_in_url {
                    format!("{}/{}{}", cdn, container, self.ctx.request_url())
                } else {
                    format!("{}{}", cdn, self.ctx.request_url())
                }
            }
            None => self.fallback_target(),
        }
    }

    fn fallback_target(&self) -> String {
        let path = self.cached_path();
        match &self.cache.signer {
            Some(signer) => match signer.sign(&path) {
                Ok(signed) => signed,
                Err(e) => {
                    tracing::warn!(error = %e, "Unable to sign cached path");
                    path
                }
            },
            None => path,
        }
    }

    /// Decide whether the artifact must be (re)generated.
    ///
    /// Returns `true` when it is stale or missing. Backend transport errors
    /// count as missing; only an unusable locator is an error.
    pub async fn check_freshness(&mut self) -> Result<bool> {
        let cache = self.cache;
        let artifact = match cache.index.get(&self.key) {
            Some(artifact) => Some(artifact),
            None => match cache.backend.metadata(&self.key).await {
                Ok(Some(meta)) => {
                    let artifact = CachedArtifact {
                        key: self.key.clone(),
                        locator: meta.locator,
                        created_at: meta.last_modified,
                        etag: meta.etag,
                    };
                    cache.index.add(artifact.clone(), cache.settings.index_ttl);
                    Some(artifact)
                }
                Ok(None) => None,
                Err(e @ BackendError::InvalidLocator(_)) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "Artifact lookup failed, treating as missing");
                    None
                }
            },
        };

        let Some(artifact) = artifact else {
            tracing::debug!(key = %self.key, "Artifact missing");
            self.state = CacheState::Missing;
            Metrics::incr(&cache.metrics.cache_misses);
            return Ok(true);
        };

        let now = OffsetDateTime::now_utc();
        let expired = cache.is_expired(artifact.created_at, now);
        let outdated = !expired
            && cache
                .probe
                .is_newer(&self.ctx.source, cache.backend.as_ref(), artifact.created_at)
                .await;

        if expired || outdated {
            tracing::debug!(key = %self.key, expired, outdated, "Artifact stale");
            cache.index.remove(&self.key);
            self.state = CacheState::Stale;
            Metrics::incr(&cache.metrics.cache_stale);
            return Ok(true);
        }

        tracing::debug!(key = %self.key, "Artifact fresh");
        self.artifact = Some(artifact);
        self.state = CacheState::Fresh;
        Metrics::incr(&cache.metrics.cache_hits);
        Ok(false)
    }

    /// Persist a freshly rendered artifact.
    ///
    /// Writing the same key twice is harmless; the last write wins. On
    /// success the request is `Fresh` and the index points at the new bytes.
    pub async fn store_artifact(&mut self, data: Bytes, content_type: &str) -> Result<()> {
        let cache = self.cache;
        let props = WriteProps {
            content_type: content_type.to_string(),
            cache_control: Some(cache.policy().cache_control_value()),
            processed_by: Some(processed_by()),
        };

        if let Err(e) = cache.backend.write(&self.key, data, &props).await {
            Metrics::incr(&cache.metrics.store_failures);
            return Err(e.into());
        }

        // Conditional requests are matched against the backend's own timestamp and tag.
        let (created_at, etag) = match cache.backend.metadata(&self.key).await {
            Ok(Some(meta)) => (meta.last_modified, meta.etag),
            Ok(None) => (OffsetDateTime::now_utc(), None),
            Err(e) => {
                tracing::debug!(key = %self.key, error = %e, "Stored artifact metadata unavailable");
                (OffsetDateTime::now_utc(), None)
            }
        };
        let artifact = CachedArtifact { key: self.key.clone(), locator: self.key.clone(), created_at, etag };
        cache.index.add(artifact.clone(), cache.settings.index_ttl);

        self.artifact = Some(artifact);
        self.state = CacheState::Fresh;
        Metrics::incr(&cache.metrics.stores);
        tracing::debug!(key = %self.key, "Artifact stored");
        Ok(())
    }

    /// Headers for a response carrying the artifact's bytes.
    ///
    /// Validators come from `stored` when the backend just reported them,
    /// otherwise from the known artifact. The ETag is the backend's; one is
    /// derived from the creation time only when the backend has none.
    pub fn response_headers(&self, content_type: Option<&str>, stored: Option<&BlobMeta>) -> HeaderMap {
        let settings = &self.cache.settings;
        let last_modified = stored.map(|m| m.last_modified).or_else(|| self.created_at());
        let mut headers = HeaderMap::new();
        set_standard_headers(
            &mut headers,
            content_type,
            last_modified,
            &self.cache.policy(),
            settings.cors_origin.as_deref(),
        );

        let etag = stored
            .and_then(|m| m.etag.clone())
            .or_else(|| self.artifact.as_ref().and_then(|a| a.etag.clone()))
            .or_else(|| last_modified.map(|c| artifact_etag(c, OffsetDateTime::now_utc())));
        if let Some(value) = etag.and_then(|e| HeaderValue::from_str(&e).ok()) {
            headers.insert(header::ETAG, value);
        }
        headers
    }

    /// Answer the request from the cached artifact.
    ///
    /// Returns `None` when the artifact turns out to be gone (or cannot be
    /// streamed) and the caller has to regenerate it.
    pub async fn rewrite(&mut self, request_headers: &HeaderMap) -> Option<Response> {
        let conditions = Conditions::from_headers(request_headers);
        let response = if self.cache.settings.stream_cached_image {
            self.stream(&conditions).await
        } else {
            self.redirect(&conditions).await
        };
        if response.is_some() {
            Metrics::incr(&self.cache.metrics.rewrites);
        }
        response
    }

    fn evict(&mut self) {
        tracing::debug!(key = %self.key, "Artifact vanished from storage");
        self.cache.index.remove(&self.key);
        self.artifact = None;
        self.state = CacheState::Missing;
    }

    fn not_modified(&self, meta: &BlobMeta) -> Response {
        (StatusCode::NOT_MODIFIED, self.response_headers(None, Some(meta))).into_response()
    }

    fn found(&self, target: &str) -> Option<Response> {
        let location = match HeaderValue::from_str(target) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target, error = %e, "Redirect target is not a valid header");
                return None;
            }
        };
        let mut headers = HeaderMap::new();
        // Signed targets expire; only CDN redirects may be cached by clients.
        let policy = if self.cache.settings.cdn_root.is_some() {
            self.cache.policy()
        } else {
            CacheControlPolicy::no_cache()
        };
        set_standard_headers(&mut headers, None, None, &policy, self.cache.settings.cors_origin.as_deref());
        headers.insert(header::LOCATION, location);
        Some((StatusCode::FOUND, headers).into_response())
    }

    async fn redirect(&mut self, conditions: &Conditions) -> Option<Response> {
        if conditions.is_empty() {
            return self.found(&self.redirect_target());
        }

        let probe = tokio::time::timeout(
            self.cache.settings.cdn_timeout,
            self.cache.backend.probe(&self.key, conditions),
        )
        .await;

        match probe {
            Ok(Ok(ProbeOutcome::NotModified(meta))) => Some(self.not_modified(&meta)),
            Ok(Ok(ProbeOutcome::Present(_))) => self.found(&self.redirect_target()),
            Ok(Ok(ProbeOutcome::NotFound)) => {
                self.evict();
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %self.key, error = %e, "Backend probe failed, redirecting to cached path");
                Metrics::incr(&self.cache.metrics.fallbacks);
                self.found(&self.fallback_target())
            }
            Err(_) => {
                tracing::warn!(key = %self.key, "Backend probe timed out, redirecting to cached path");
                Metrics::incr(&self.cache.metrics.fallbacks);
                self.found(&self.fallback_target())
            }
        }
    }

    async fn stream(&mut self, conditions: &Conditions) -> Option<Response> {
        let read = tokio::time::timeout(
            self.cache.settings.cdn_timeout,
            self.cache.backend.read(&self.key, conditions),
        )
        .await;

        match read {
            Ok(Ok(ReadOutcome::NotModified(meta))) => Some(self.not_modified(&meta)),
            Ok(Ok(ReadOutcome::Content { meta, body })) => {
                let content_type = meta
                    .content_type
                    .clone()
                    .unwrap_or_else(|| self.ctx.format.content_type().to_string());
                let mut headers = self.response_headers(Some(&content_type), Some(&meta));
                if meta.size > 0 {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
                }
                Some((StatusCode::OK, headers, Body::from_stream(body)).into_response())
            }
            Ok(Ok(ReadOutcome::NotFound)) => {
                self.evict();
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(key = %self.key, error = %e, "Unable to stream cached artifact");
                None
            }
            Err(_) => {
                tracing::warn!(key = %self.key, "Timed out opening cached artifact");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_weak_while_recent() {
        let now = OffsetDateTime::from_unix_timestamp(1_000_000).unwrap();
        let recent = now - time::Duration::seconds(1);
        let old = now - time::Duration::seconds(10);
        assert!(artifact_etag(recent, now).starts_with("W/\""));
        assert_eq!(artifact_etag(old, now), format!("\"{:x}\"", old.unix_timestamp()));
    }

    #[test]
    fn request_url_joins_query() {
        let ctx = RequestContext {
            request_path: "/images/photo.jpg".into(),
            query: "width=200".into(),
            source: SourceLocation::File("public/images/photo.jpg".into()),
            format: ImageFormat::Jpeg,
        };
        assert_eq!(ctx.request_url(), "/images/photo.jpg?width=200");
        let bare = RequestContext { query: String::new(), ..ctx };
        assert_eq!(bare.request_url(), "/images/photo.jpg");
    }
}
