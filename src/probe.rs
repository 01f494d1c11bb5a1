use crate::backend::StorageBackend;
use reqwest::{header, Client};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

const IMF_NO_ZONE: &[FormatItem<'static>] =
    format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second]");

/// Parse an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
///
/// Some crawlers send a `UTC` zone instead of `GMT`; those get a second
/// attempt with the suffix stripped. Returns `None` when neither parses.
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Ok(dt) = PrimitiveDateTime::parse(value, IMF_FIXDATE) {
        return Some(dt.assume_utc());
    }
    let stripped = value.strip_suffix("UTC")?.trim_end();
    PrimitiveDateTime::parse(stripped, IMF_NO_ZONE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

pub fn format_http_date(ts: OffsetDateTime) -> String {
    ts.to_offset(UtcOffset::UTC)
        .format(IMF_FIXDATE)
        .unwrap_or_default()
}

/// Where the original image of a request lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Static file on local disk.
    File(PathBuf),
    /// Absolute URL of a remote origin.
    Remote(String),
    /// Locator of an uploaded original in the storage backend.
    Blob(String),
}

/// Decides whether a source changed after an artifact was produced from it.
///
/// Each source kind has exactly one policy: files compare their write time,
/// remote sources are probed with `HEAD` and compare `Last-Modified`, blobs
/// compare backend metadata. Anything that goes wrong counts as "not newer"
/// so a flaky origin never forces regeneration.
#[derive(Clone)]
pub struct SourceProbe {
    client: Client,
    timeout: Duration,
}

impl SourceProbe {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn is_newer<B>(&self, source: &SourceLocation, backend: &B, than: OffsetDateTime) -> bool
    where
        B: StorageBackend + ?Sized,
    {
        let modified = match source {
            SourceLocation::File(path) => self.file_modified(path).await,
            SourceLocation::Remote(url) => self.remote_modified(url).await,
            SourceLocation::Blob(locator) => match backend.metadata(locator).await {
                Ok(meta) => meta.map(|m| m.last_modified),
                Err(e) => {
                    tracing::debug!(locator, error = %e, "Source blob metadata unavailable");
                    None
                }
            },
        };
        modified.is_some_and(|m| m > than)
    }

    async fn file_modified(&self, path: &Path) -> Option<OffsetDateTime> {
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(t) => Some(OffsetDateTime::from(t)),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Source file metadata unavailable");
                None
            }
        }
    }

    async fn remote_modified(&self, url: &str) -> Option<OffsetDateTime> {
        let resp = match self.client.head(url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(url, error = %e, "Remote source probe failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(url, status = %resp.status(), "Remote source probe returned non-success");
            return None;
        }
        resp.headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
    }
}
