use crate::key::is_cache_artifact;
use crate::probe::SourceLocation;
use std::path::PathBuf;

/// A resolved content item behind a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    /// Stable identity used in logs.
    pub id: String,
    /// Storage segment owning the item; `None` for static files.
    pub container: Option<String>,
    pub source: SourceLocation,
}

/// Maps request paths to content items and gates read access.
pub trait ContentResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<ContentItem>;
    fn can_read(&self, item: &ContentItem) -> bool;
}

/// Path-prefix based resolver.
///
/// - `/{media_prefix}/{container}/{file..}` is an uploaded original stored
///   in the backend under `{container}/{file..}`
/// - `/{remote_prefix}/{rest..}` is fetched from `remote_origin`
/// - anything else is a static file below `static_root`
#[derive(Debug, Clone)]
pub struct MediaResolver {
    pub static_root: PathBuf,
    pub media_prefix: String,
    pub remote_prefix: String,
    pub remote_origin: Option<String>,
}

impl MediaResolver {
    pub fn from_settings(settings: &crate::config::CacheSettings) -> Self {
        Self {
            static_root: settings.static_root.clone(),
            media_prefix: settings.media_prefix.clone(),
            remote_prefix: settings.remote_prefix.clone(),
            remote_origin: settings.remote_origin.clone(),
        }
    }
}

impl ContentResolver for MediaResolver {
    fn resolve(&self, path: &str) -> Option<ContentItem> {
        let trimmed = path.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|s| s.is_empty() || *s == "." || *s == ".." || s.contains('\\')) {
            return None;
        }

        match segments.as_slice() {
            [prefix, container, rest @ ..] if *prefix == self.media_prefix && !rest.is_empty() => {
                let locator = segments[1..].join("/");
                Some(ContentItem {
                    id: locator.clone(),
                    container: Some(container.to_string()),
                    source: SourceLocation::Blob(locator),
                })
            }
            [prefix, rest @ ..] if *prefix == self.remote_prefix && !rest.is_empty() => {
                let origin = self.remote_origin.as_ref()?;
                let rest = rest.join("/");
                Some(ContentItem {
                    id: format!("remote:{}", rest),
                    container: None,
                    source: SourceLocation::Remote(format!("{}/{}", origin, rest)),
                })
            }
            _ => Some(ContentItem {
                id: format!("static:{}", trimmed),
                container: None,
                source: SourceLocation::File(self.static_root.join(trimmed)),
            }),
        }
    }

    /// Generated artifacts and hidden files are never served as sources.
    fn can_read(&self, item: &ContentItem) -> bool {
        let name = item.id.rsplit('/').next().unwrap_or(&item.id);
        !name.starts_with('.') && !is_cache_artifact(&item.id)
    }
}
