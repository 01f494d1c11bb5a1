use crate::backend::{
    validate_locator, BackendError, BackendResult, BlobMeta, Conditions, ListPage, ReadOutcome,
    StorageBackend, WriteProps,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::Db;
use std::path::Path;
use time::OffsetDateTime;

/// Metadata stored alongside each blob
#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredMeta {
    locator: String,
    content_type: String,
    cache_control: Option<String>,
    processed_by: Option<String>,
    size: u64,
    modified_at_ms: i64,
    etag: String,
}

impl StoredMeta {
    fn to_blob_meta(&self) -> BlobMeta {
        let modified = OffsetDateTime::from_unix_timestamp_nanos(self.modified_at_ms as i128 * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        BlobMeta {
            locator: self.locator.clone(),
            last_modified: modified,
            content_type: Some(self.content_type.clone()),
            size: self.size,
            etag: Some(self.etag.clone()),
        }
    }
}

/// Sled-backed blob store.
///
/// Keeps bytes under `data:<locator>` and JSON metadata under
/// `meta:<locator>`; both are written in one atomic batch.
pub struct EmbeddedBackend {
    db: Db,
}

impl EmbeddedBackend {
    /// Open the sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let db = sled::open(path).map_err(|e| BackendError::Embedded(format!("Failed to open Sled database: {}", e)))?;
        Ok(Self { db })
    }

    fn metadata_key(locator: &str) -> String {
        format!("meta:{}", locator)
    }

    fn data_key(locator: &str) -> String {
        format!("data:{}", locator)
    }

    fn load_meta(&self, locator: &str) -> BackendResult<Option<StoredMeta>> {
        match self.db.get(Self::metadata_key(locator).as_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| BackendError::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for EmbeddedBackend {
    fn name(&self) -> &'static str {
        "embedded"
    }

    async fn metadata(&self, locator: &str) -> BackendResult<Option<BlobMeta>> {
        validate_locator(locator)?;
        Ok(self.load_meta(locator)?.map(|m| m.to_blob_meta()))
    }

    async fn read(&self, locator: &str, conditions: &Conditions) -> BackendResult<ReadOutcome> {
        validate_locator(locator)?;
        let Some(meta) = self.load_meta(locator)?.map(|m| m.to_blob_meta()) else {
            return Ok(ReadOutcome::NotFound);
        };
        if conditions.not_modified(&meta) {
            return Ok(ReadOutcome::NotModified(meta));
        }
        let Some(data) = self.db.get(Self::data_key(locator).as_bytes())? else {
            return Ok(ReadOutcome::NotFound);
        };
        let chunk = Bytes::copy_from_slice(&data);
        let body = Box::pin(futures::stream::once(async move { Ok::<_, std::io::Error>(chunk) }));
        Ok(ReadOutcome::Content { meta, body })
    }

    async fn write(&self, locator: &str, data: Bytes, props: &WriteProps) -> BackendResult<()> {
        validate_locator(locator)?;
        let now = OffsetDateTime::now_utc();
        let digest = Sha256::digest(&data);

        let meta = StoredMeta {
            locator: locator.to_string(),
            content_type: props.content_type.clone(),
            cache_control: props.cache_control.clone(),
            processed_by: props.processed_by.clone(),
            size: data.len() as u64,
            modified_at_ms: (now.unix_timestamp_nanos() / 1_000_000) as i64,
            etag: format!("\"{}\"", hex::encode(&digest[..16])),
        };
        let meta_bytes = serde_json::to_vec(&meta).map_err(|e| BackendError::Decode(e.to_string()))?;

        let mut batch = sled::Batch::default();
        batch.insert(Self::data_key(locator).as_bytes(), data.as_ref());
        batch.insert(Self::metadata_key(locator).as_bytes(), meta_bytes);
        self.db.apply_batch(batch)?;
        self.db.flush_async().await?;

        tracing::debug!(locator, size = meta.size, "Stored blob in embedded store");
        Ok(())
    }

    async fn list(&self, prefix: &str, marker: Option<&str>, limit: usize) -> BackendResult<ListPage> {
        let marker_key = marker.map(Self::metadata_key);
        let mut items = Vec::with_capacity(limit.min(1024));
        let mut next_marker = None;

        for entry in self.db.scan_prefix(Self::metadata_key(prefix).as_bytes()) {
            let (key, value) = entry?;
            if let Some(mk) = &marker_key {
                if key.as_ref() <= mk.as_bytes() {
                    continue;
                }
            }
            if items.len() == limit {
                next_marker = items.last().map(|m: &BlobMeta| m.locator.clone());
                break;
            }
            match serde_json::from_slice::<StoredMeta>(&value) {
                Ok(meta) => items.push(meta.to_blob_meta()),
                Err(e) => tracing::warn!(key = %String::from_utf8_lossy(&key), error = %e, "Skipping corrupt metadata"),
            }
        }

        Ok(ListPage { items, next_marker })
    }

    async fn delete(&self, locator: &str) -> BackendResult<()> {
        validate_locator(locator)?;
        let mut batch = sled::Batch::default();
        batch.remove(Self::data_key(locator).as_bytes());
        batch.remove(Self::metadata_key(locator).as_bytes());
        self.db.apply_batch(batch)?;
        Ok(())
    }
}
