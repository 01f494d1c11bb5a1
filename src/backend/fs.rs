use crate::backend::{
    validate_locator, BackendError, BackendResult, BlobMeta, Conditions, ListPage, ReadOutcome, StorageBackend,
    WriteProps,
};
use crate::config::ImageFormat;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage rooted at a single directory.
///
/// Locators map directly onto relative paths. Content type and other write
/// properties are not persisted; the content type is derived from the
/// extension on read.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (and create if needed) the root directory.
    pub async fn open(root: PathBuf) -> BackendResult<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> BackendResult<PathBuf> {
        Ok(self.root.join(validate_locator(locator)?))
    }

    fn meta_from(locator: &str, meta: &std::fs::Metadata) -> BlobMeta {
        let modified = meta
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let size = meta.len();
        BlobMeta {
            locator: locator.to_string(),
            last_modified: modified,
            content_type: ImageFormat::from_path(locator).map(|f| f.content_type().to_string()),
            size,
            etag: Some(format!("\"{:x}-{:x}\"", modified.unix_timestamp(), size)),
        }
    }

    /// Walk the tree under `dir`, collecting `(locator, metadata)` for every file.
    async fn walk(&self, dir: PathBuf) -> BackendResult<Vec<BlobMeta>> {
        let mut out = Vec::new();
        let mut stack = vec![dir];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // In-flight writes
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() {
                    if let Some(locator) = self.locator_for(&path) {
                        out.push(Self::meta_from(&locator, &meta));
                    }
                }
            }
        }
        Ok(out)
    }

    fn locator_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    /// Remove empty directories from `dir` upwards, stopping at the root.
    async fn prune_empty_dirs(&self, mut dir: PathBuf) {
        while dir != self.root && dir.starts_with(&self.root) {
            let empty = match fs::read_dir(&dir).await {
                Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
                Err(_) => false,
            };
            if !empty {
                break;
            }
            if let Err(e) = fs::remove_dir(&dir).await {
                tracing::debug!(path = %dir.display(), error = %e, "Unable to remove cache directory");
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn metadata(&self, locator: &str) -> BackendResult<Option<BlobMeta>> {
        let p = self.path_for(locator)?;
        match fs::metadata(&p).await {
            Ok(meta) if meta.is_file() => Ok(Some(Self::meta_from(locator, &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, locator: &str, conditions: &Conditions) -> BackendResult<ReadOutcome> {
        let Some(meta) = self.metadata(locator).await? else {
            return Ok(ReadOutcome::NotFound);
        };
        if conditions.not_modified(&meta) {
            return Ok(ReadOutcome::NotModified(meta));
        }
        let file = match fs::File::open(self.path_for(locator)?).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(ReadOutcome::Content { meta, body: ReaderStream::new(file).boxed() })
    }

    async fn write(&self, locator: &str, data: Bytes, _props: &WriteProps) -> BackendResult<()> {
        let path = self.path_for(locator)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file then rename so readers never see a partial artifact.
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackendError::InvalidLocator(locator.to_string()))?;
        let tmp = path.with_file_name(format!(".{}.tmp-{}-{}", file_name, std::process::id(), seq));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(tmp = %tmp.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e.into());
        }

        tracing::debug!(locator, size = data.len(), "Stored blob on disk");
        Ok(())
    }

    async fn list(&self, prefix: &str, marker: Option<&str>, limit: usize) -> BackendResult<ListPage> {
        // Only walk the deepest directory fully covered by the prefix.
        let dir_part = prefix.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(validate_locator(dir_part)?)
        };

        let mut items: Vec<BlobMeta> = self
            .walk(start)
            .await?
            .into_iter()
            .filter(|m| m.locator.starts_with(prefix))
            .filter(|m| marker.map_or(true, |mk| m.locator.as_str() > mk))
            .collect();
        items.sort_by(|a, b| a.locator.cmp(&b.locator));

        let next_marker = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|m| m.locator.clone())
        } else {
            None
        };
        Ok(ListPage { items, next_marker })
    }

    async fn delete(&self, locator: &str) -> BackendResult<()> {
        let path = self.path_for(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent.to_path_buf()).await;
        }
        Ok(())
    }
}
