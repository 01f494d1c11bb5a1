use crate::backend::{Conditions, ReadOutcome, StorageBackend};
use crate::content::ContentItem;
use crate::fetch::fetch_source;
use crate::probe::SourceLocation;
use crate::{ImageCacheError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Loads original images for the transform pipeline.
pub struct SourceService<B: StorageBackend> {
    backend: Arc<B>,
    client: Client,
    max_bytes: usize,
    timeout: Duration,
}

impl<B: StorageBackend> SourceService<B> {
    pub fn new(backend: Arc<B>, client: Client, max_bytes: usize, timeout: Duration) -> Self {
        Self { backend, client, max_bytes, timeout }
    }

    /// Read the whole source into memory, bounded by the size limit.
    pub async fn load(&self, item: &ContentItem) -> Result<Bytes> {
        match &item.source {
            SourceLocation::File(path) => self.load_file(path).await,
            SourceLocation::Remote(url) => {
                let (bytes, _) = fetch_source(&self.client, url, self.max_bytes, self.timeout).await?;
                Ok(bytes)
            }
            SourceLocation::Blob(locator) => self.load_blob(locator).await,
        }
    }

    async fn load_file(&self, path: &Path) -> Result<Bytes> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(ImageCacheError::NotFound(path.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageCacheError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(ImageCacheError::InternalError(e.to_string())),
        };
        if meta.len() as usize > self.max_bytes {
            return Err(ImageCacheError::InvalidArgument("Input exceeds size limit".into()));
        }
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| ImageCacheError::InternalError(e.to_string()))
    }

    async fn load_blob(&self, locator: &str) -> Result<Bytes> {
        let mut body = match self.backend.read(locator, &Conditions::default()).await? {
            ReadOutcome::Content { meta, body } => {
                if meta.size as usize > self.max_bytes {
                    return Err(ImageCacheError::InvalidArgument("Input exceeds size limit".into()));
                }
                body
            }
            ReadOutcome::NotFound => return Err(ImageCacheError::NotFound(locator.to_string())),
            ReadOutcome::NotModified(_) => {
                return Err(ImageCacheError::InternalError(format!(
                    "unconditional read of {} returned not modified",
                    locator
                )))
            }
        };

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ImageCacheError::InternalError(e.to_string()))?;
            if buf.len() + chunk.len() > self.max_bytes {
                return Err(ImageCacheError::InvalidArgument("Input exceeds size limit".into()));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FsBackend, WriteProps};
    use tempfile::TempDir;

    async fn service(dir: &TempDir, max: usize) -> SourceService<FsBackend> {
        let backend = Arc::new(FsBackend::open(dir.path().join("blobs")).await.unwrap());
        SourceService::new(backend, Client::new(), max, Duration::from_secs(1))
    }

    fn item(source: SourceLocation) -> ContentItem {
        ContentItem { id: "x".into(), container: None, source }
    }

    #[tokio::test]
    async fn loads_files_and_blobs() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1024).await;

        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"file-bytes").unwrap();
        assert_eq!(svc.load(&item(SourceLocation::File(file))).await.unwrap(), Bytes::from_static(b"file-bytes"));

        svc.backend
            .write("c1/orig.jpg", Bytes::from_static(b"blob-bytes"), &WriteProps::default())
            .await
            .unwrap();
        assert_eq!(
            svc.load(&item(SourceLocation::Blob("c1/orig.jpg".into()))).await.unwrap(),
            Bytes::from_static(b"blob-bytes")
        );
    }

    #[tokio::test]
    async fn missing_sources_are_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 1024).await;
        assert!(matches!(
            svc.load(&item(SourceLocation::File(dir.path().join("nope.jpg")))).await,
            Err(ImageCacheError::NotFound(_))
        ));
        assert!(matches!(
            svc.load(&item(SourceLocation::Blob("c1/nope.jpg".into()))).await,
            Err(ImageCacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn oversized_sources_are_rejected() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, 4).await;
        let file = dir.path().join("a.jpg");
        std::fs::write(&file, b"too many bytes").unwrap();
        assert!(matches!(
            svc.load(&item(SourceLocation::File(file))).await,
            Err(ImageCacheError::InvalidArgument(_))
        ));
    }
}
