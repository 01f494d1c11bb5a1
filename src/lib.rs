use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceExt;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::services::ServeDir;

pub mod adapter;
pub mod backend;
pub mod config;
pub mod content;
pub mod fetch;
pub mod headers;
pub mod index;
pub mod key;
pub mod metrics;
pub mod probe;
pub mod service;
pub mod signature;
pub mod transform;
pub mod trim;

use crate::adapter::{ImageCache, RequestContext};
use crate::backend::{BackendError, BlobMeta, ConfiguredBackend, Conditions, ReadOutcome, StorageBackend};
use crate::config::{CacheSettings, ConfigError, ImageFormat};
use crate::content::{ContentResolver, MediaResolver};
use crate::headers::{set_standard_headers, CacheControlPolicy};
use crate::key::is_cache_artifact;
use crate::metrics::Metrics;
use crate::service::SourceService;
use crate::signature::SignatureError;
use crate::transform::{is_transform_query, TransformParams};

#[derive(Error, Debug)]
pub enum ImageCacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] BackendError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("Transformation error: {0}")]
    TransformError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Internal server error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ImageCacheError>;

impl ImageCacheError {
    pub fn status(&self) -> StatusCode {
        match self {
            ImageCacheError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageCacheError::InvalidArgument(_) | ImageCacheError::TransformError(_) => StatusCode::BAD_REQUEST,
            ImageCacheError::Storage(BackendError::InvalidLocator(_)) => StatusCode::BAD_REQUEST,
            ImageCacheError::Forbidden(_) => StatusCode::FORBIDDEN,
            ImageCacheError::Signature(SignatureError::Expired) => StatusCode::GONE,
            ImageCacheError::Signature(_) => StatusCode::UNAUTHORIZED,
            ImageCacheError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ImageCacheError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

/// Everything the handlers share.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ImageCache<ConfiguredBackend>>,
    pub sources: Arc<SourceService<ConfiguredBackend>>,
    pub resolver: Arc<dyn ContentResolver>,
    pub static_files: ServeDir,
}

impl AppState {
    /// Open the configured backend and wire up the adapter.
    pub async fn from_settings(settings: CacheSettings) -> Result<Self> {
        let backend = ConfiguredBackend::open(&settings.backend, settings.cdn_timeout).await?;
        Self::with_backend(Arc::new(backend), settings)
    }

    pub fn with_backend(backend: Arc<ConfiguredBackend>, settings: CacheSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(headers::processed_by())
            .build()
            .map_err(|e| ImageCacheError::InternalError(e.to_string()))?;

        let sources = SourceService::new(
            backend.clone(),
            client.clone(),
            settings.max_source_bytes,
            settings.source_timeout,
        );
        let resolver = MediaResolver::from_settings(&settings);
        let static_files = ServeDir::new(&settings.static_root);
        let cache = ImageCache::new(backend, settings, client);

        Ok(Self {
            cache: Arc::new(cache),
            sources: Arc::new(sources),
            resolver: Arc::new(resolver),
            static_files,
        })
    }

    fn metrics(&self) -> &Metrics {
        self.cache.metrics()
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imagecache",
        "backend": state.cache.backend().name(),
    }))
}

async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let s = state.metrics().snapshot();
    let settings = state.cache.settings();
    Json(serde_json::json!({
        "index": {
            "entries": state.cache.index().len(),
            "ttl_secs": settings.index_ttl.as_secs(),
        },
        "backend": state.cache.backend().name(),
        "max_age_secs": settings.max_age.as_secs(),
        "requests": {
            "cache_hits": s.cache_hits,
            "cache_misses": s.cache_misses,
            "cache_stale": s.cache_stale,
            "hit_rate_percent": s.hit_rate_percent(),
            "rewrites": s.rewrites,
            "fallbacks": s.fallbacks,
        },
        "storage": {
            "stores": s.stores,
            "store_failures": s.store_failures,
            "trimmed": s.trimmed,
        },
        "transforms": {
            "total": s.transforms,
            "errors": s.errors,
        }
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().render(),
    )
}

#[derive(Debug, Deserialize)]
struct SignedQuery {
    st: Option<i64>,
    se: Option<i64>,
    sig: Option<String>,
}

fn blob_headers(state: &AppState, content_type: Option<&str>, meta: &BlobMeta) -> HeaderMap {
    let settings = state.cache.settings();
    let policy = CacheControlPolicy::for_images(settings.browser_max_days);
    let mut out = HeaderMap::new();
    set_standard_headers(&mut out, content_type, Some(meta.last_modified), &policy, settings.cors_origin.as_deref());
    if let Some(etag) = meta.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
        out.insert(header::ETAG, etag);
    }
    out
}

/// Serve a stored artifact by locator.
///
/// Only generated artifacts are reachable here; uploaded originals and
/// anything else in the backend are refused.
async fn blob_handler(
    State(state): State<AppState>,
    Path(locator): Path<String>,
    Query(query): Query<SignedQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    if !is_cache_artifact(&locator) || locator.split('/').any(|seg| seg.starts_with('.')) {
        return Err(ImageCacheError::Forbidden(locator));
    }
    if let Some(signer) = state.cache.signer() {
        signer.verify(uri.path(), query.st, query.se, query.sig.as_deref())?;
    }

    let conditions = Conditions::from_headers(&headers);

    match state.cache.backend().read(&locator, &conditions).await? {
        ReadOutcome::NotFound => Err(ImageCacheError::NotFound(locator)),
        ReadOutcome::NotModified(meta) => {
            Ok((StatusCode::NOT_MODIFIED, blob_headers(&state, None, &meta)).into_response())
        }
        ReadOutcome::Content { meta, body } => {
            let content_type = meta
                .content_type
                .clone()
                .or_else(|| ImageFormat::from_path(&locator).map(|f| f.content_type().to_string()))
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
            let out = blob_headers(&state, Some(&content_type), &meta);
            Ok((StatusCode::OK, out, Body::from_stream(body)).into_response())
        }
    }
}

async fn passthrough(state: &AppState, req: Request) -> Response {
    match state.static_files.clone().oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(never) => match never {},
    }
}

/// Everything that is not an API route: transform requests go through the
/// cache, the rest is served from the static root.
async fn image_handler(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let hint = ImageFormat::from_path(&path);

    let is_image_request = (req.method() == Method::GET || req.method() == Method::HEAD)
        && hint.is_some()
        && is_transform_query(&query);
    if !is_image_request {
        return passthrough(&state, req).await;
    }

    tracing::debug!(path, query, "Processing image request");
    let headers = req.headers().clone();
    match serve_image(&state, &path, &query, hint, &headers).await {
        Ok(resp) => resp,
        Err(e) => {
            Metrics::incr(&state.metrics().errors);
            e.into_response()
        }
    }
}

async fn serve_image(
    state: &AppState,
    path: &str,
    query: &str,
    hint: Option<ImageFormat>,
    request_headers: &HeaderMap,
) -> Result<Response> {
    let params = TransformParams::parse(query)?;
    let item = state
        .resolver
        .resolve(path)
        .ok_or_else(|| ImageCacheError::NotFound(path.to_string()))?;
    if !state.resolver.can_read(&item) {
        return Err(ImageCacheError::Forbidden(path.to_string()));
    }

    let ctx = RequestContext {
        request_path: path.to_string(),
        query: query.to_string(),
        source: item.source.clone(),
        format: params.output_format(hint),
    };
    let mut request = state.cache.request(ctx, item.container.as_deref());

    if !request.check_freshness().await? {
        if let Some(resp) = request.rewrite(request_headers).await {
            tracing::info!(key = request.key(), state = ?request.state(), "Served from cache");
            return Ok(resp);
        }
    }

    tracing::info!(key = request.key(), state = ?request.state(), source = %item.id, "Rendering image");
    let source = state.sources.load(&item).await?;
    Metrics::incr(&state.metrics().transforms);
    let (encoded, format) = tokio::task::spawn_blocking(move || transform::process(&source, &params, hint))
        .await
        .map_err(|e| ImageCacheError::InternalError(e.to_string()))??;

    if let Err(e) = request.store_artifact(encoded.clone(), format.content_type()).await {
        // Still serve the image we just rendered.
        tracing::warn!(key = request.key(), error = %e, "Failed to cache transformed image");
    }

    let headers = request.response_headers(Some(format.content_type()), None);
    Ok((StatusCode::OK, headers, Body::from(encoded)).into_response())
}

pub fn router(state: AppState) -> Router {
    let settings = state.cache.settings();

    // Observability endpoints - NO rate limiting
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/stats/cache", get(cache_stats_handler))
        .route("/metrics", get(metrics_handler));

    let mut image_routes = Router::new()
        .route("/blobs/*locator", get(blob_handler))
        .fallback(image_handler);

    if let Some(per_second) = settings.rate_limit_per_second.filter(|n| *n > 0) {
        let burst = settings
            .rate_limit_burst
            .unwrap_or_else(|| u32::try_from(per_second.saturating_mul(3)).unwrap_or(u32::MAX));
        match GovernorConfigBuilder::default().per_second(per_second).burst_size(burst).finish() {
            Some(conf) => {
                tracing::info!(per_second, burst, "Image routes rate limited");
                image_routes = image_routes.layer(GovernorLayer { config: Box::leak(Box::new(conf)) });
            }
            None => tracing::warn!(per_second, burst, "Invalid rate limit, serving without one"),
        }
    }

    Router::new()
        .merge(observability_routes)
        .merge(image_routes)
        .with_state(state)
}
