use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// One materialized transform of a source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub key: String,
    /// Backend locator used to read and write the bytes.
    pub locator: String,
    /// When the backend confirmed the artifact exists.
    pub created_at: OffsetDateTime,
    /// Entity tag the backend reports for the stored bytes.
    pub etag: Option<String>,
}

/// Soft key → artifact lookup.
///
/// Losing entries is always safe: a miss falls through to the storage
/// backend. Each call is atomic on its own; nothing spans calls.
pub trait CacheIndex: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedArtifact>;
    fn add(&self, artifact: CachedArtifact, ttl: Duration);
    fn remove(&self, key: &str);
    fn clear(&self);
    fn len(&self) -> usize;

    /// Drop every expired entry, returning how many went.
    fn purge_expired(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expired entries are swept after this many inserts.
const PURGE_EVERY: usize = 1024;

/// In-process index with per-entry expiry.
///
/// A `None` deadline never expires; it is what a TTL too large for
/// `Instant` turns into.
#[derive(Default)]
pub struct MemoryIndex {
    entries: DashMap<String, (CachedArtifact, Option<Instant>)>,
    inserts: AtomicUsize,
}

fn is_live(expires: Option<Instant>, now: Instant) -> bool {
    expires.map_or(true, |at| now < at)
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheIndex for MemoryIndex {
    fn get(&self, key: &str) -> Option<CachedArtifact> {
        let hit = self.entries.get(key).map(|e| {
            let (artifact, expires) = e.value();
            (artifact.clone(), *expires)
        });
        match hit {
            Some((artifact, expires)) if is_live(expires, Instant::now()) => Some(artifact),
            Some(_) => {
                // Only drop the entry we saw; a concurrent add may have replaced it.
                self.entries.remove_if(key, |_, (_, expires)| !is_live(*expires, Instant::now()));
                None
            }
            None => None,
        }
    }

    fn add(&self, artifact: CachedArtifact, ttl: Duration) {
        let expires = Instant::now().checked_add(ttl);
        self.entries.insert(artifact.key.clone(), (artifact, expires));

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = self.entries.len(), "Purged expired index entries");
            }
        }
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| is_live(*expires, now));
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(key: &str) -> CachedArtifact {
        CachedArtifact {
            key: key.into(),
            locator: key.into(),
            created_at: OffsetDateTime::now_utc(),
            etag: None,
        }
    }

    #[test]
    fn add_get_remove() {
        let index = MemoryIndex::new();
        index.add(artifact("c/ic~a.jpg"), Duration::from_secs(60));
        assert_eq!(index.get("c/ic~a.jpg").unwrap().locator, "c/ic~a.jpg");
        assert_eq!(index.len(), 1);

        index.remove("c/ic~a.jpg");
        assert!(index.get("c/ic~a.jpg").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn expired_entries_are_dropped_on_read() {
        let index = MemoryIndex::new();
        index.add(artifact("k"), Duration::ZERO);
        assert!(index.get("k").is_none());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn entries_read_once_do_not_pile_up() {
        let index = MemoryIndex::new();
        for i in 0..PURGE_EVERY - 1 {
            index.add(artifact(&format!("c/ic~{i}.jpg")), Duration::ZERO);
        }
        index.add(artifact("c/ic~live.jpg"), Duration::from_secs(60));

        assert_eq!(index.len(), 1);
        assert!(index.get("c/ic~live.jpg").is_some());
    }

    #[test]
    fn purge_keeps_live_entries() {
        let index = MemoryIndex::new();
        index.add(artifact("old"), Duration::ZERO);
        index.add(artifact("new"), Duration::from_secs(60));
        assert_eq!(index.purge_expired(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn huge_ttl_never_expires() {
        let index = MemoryIndex::new();
        index.add(artifact("k"), Duration::MAX);
        assert!(index.get("k").is_some());
        assert_eq!(index.purge_expired(), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let index = MemoryIndex::new();
        index.add(artifact("a"), Duration::from_secs(60));
        index.add(artifact("b"), Duration::from_secs(60));
        index.clear();
        assert!(index.is_empty());
    }
}
