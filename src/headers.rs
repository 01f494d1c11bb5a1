use crate::probe::format_http_date;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use time::OffsetDateTime;

/// Provenance header attached to every processed image.
pub const PROCESSED_BY_HEADER: HeaderName = HeaderName::from_static("x-image-processed-by");

/// Value of the provenance tag, `imagecache/<version>`.
pub fn processed_by() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Browser caching directives for image responses.
#[derive(Clone, Debug)]
pub struct CacheControlPolicy {
    /// Client cache lifetime in seconds (`max-age`).
    pub browser_max_age: u64,
    /// Allow shared caches (CDNs, proxies) to store the response.
    pub public: bool,
    /// Artifact names are content addressed, so clients never need to revalidate.
    pub immutable: bool,
}

impl CacheControlPolicy {
    pub fn for_images(browser_max_days: u64) -> Self {
        Self {
            browser_max_age: browser_max_days.saturating_mul(86_400),
            public: true,
            immutable: false,
        }
    }

    pub fn no_cache() -> Self {
        Self { browser_max_age: 0, public: false, immutable: false }
    }

    pub fn cache_control_value(&self) -> String {
        if self.browser_max_age == 0 {
            return "no-store, no-cache, must-revalidate".to_string();
        }

        let mut parts = vec![
            if self.public { "public" } else { "private" }.to_string(),
            format!("max-age={}", self.browser_max_age),
        ];
        if self.immutable {
            parts.push("immutable".to_string());
        }
        parts.join(", ")
    }
}

/// Set the headers every image response carries.
///
/// `content_type` is `None` on 304 responses, which must not describe a body.
pub fn set_standard_headers(
    headers: &mut HeaderMap,
    content_type: Option<&str>,
    last_modified: Option<OffsetDateTime>,
    policy: &CacheControlPolicy,
    cors_origin: Option<&str>,
) {
    if let Some(ct) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        headers.insert(header::CONTENT_TYPE, ct);
    }
    if let Ok(value) = HeaderValue::from_str(&policy.cache_control_value()) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Some(ts) = last_modified {
        if let Ok(value) = HeaderValue::from_str(&format_http_date(ts)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&processed_by()) {
        headers.insert(PROCESSED_BY_HEADER, value);
    }
    if let Some(origin) = cors_origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
}
