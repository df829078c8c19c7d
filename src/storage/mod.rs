//! Persistence sink
//!
//! Provides:
//! - An object-storage seam for durable image hosting
//! - A content-addressed SQLite image store behind that seam
//! - Best-effort image persistence that falls back to the provider URL
//! - A background writer for task and asset records

mod images;
mod records;

pub use images::{ImageData, ImageStore};
pub use records::{Asset, AssetRecord, AssetStore, RecordWriter, TaskRecord, TaskState};

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::providers::ImageRef;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Durable object storage
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes under `folder` and return a public URL for them
    async fn put(&self, folder: &str, data: &[u8], mime_type: &str) -> Result<String, StorageError>;
}

/// Where a persisted image ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedImage {
    pub url: String,
    /// False when the URL is the provider's own (possibly expiring) link
    pub durable: bool,
}

/// Copies generated images into durable storage
#[derive(Clone)]
pub struct PersistenceSink {
    storage: Arc<dyn ObjectStorage>,
    client: Client,
}

impl PersistenceSink {
    pub fn new(storage: Arc<dyn ObjectStorage>, client: Client) -> Self {
        Self { storage, client }
    }

    /// Upload an image; on any failure return the best URL we already have
    pub async fn persist_image(&self, image: &ImageRef, folder: &str) -> PersistedImage {
        let (data, mime_type) = match image {
            ImageRef::Bytes { data, mime_type } => (data.clone(), mime_type.clone()),
            ImageRef::Url(url) => match self.fetch(url).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!("Could not fetch {} for persistence: {}", url, e);
                    return PersistedImage {
                        url: url.clone(),
                        durable: false,
                    };
                }
            },
        };

        match self.storage.put(folder, &data, &mime_type).await {
            Ok(url) => {
                debug!("Persisted image to {}", url);
                PersistedImage { url, durable: true }
            }
            Err(e) => {
                warn!("Image upload failed, returning provider URL: {}", e);
                PersistedImage {
                    url: image.to_url(),
                    durable: false,
                }
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), StorageError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StorageError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StorageError::Fetch(format!("HTTP error: {}", response.status())));
        }

        let mime_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();

        let data = response
            .bytes()
            .await
            .map_err(|e| StorageError::Fetch(e.to_string()))?;

        Ok((data.to_vec(), mime_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_pool;

    struct BrokenStorage;

    #[async_trait]
    impl ObjectStorage for BrokenStorage {
        async fn put(&self, _folder: &str, _data: &[u8], _mime: &str) -> Result<String, StorageError> {
            Err(StorageError::Fetch("bucket unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_persist_bytes() {
        let store = ImageStore::new(test_pool().await, "http://localhost:8080");
        let sink = PersistenceSink::new(Arc::new(store.clone()), Client::new());

        let image = ImageRef::Bytes {
            data: b"jpeg".to_vec(),
            mime_type: "image/jpeg".to_string(),
        };
        let persisted = sink.persist_image(&image, "generated").await;
        assert!(persisted.durable);
        assert!(persisted.url.starts_with("http://localhost:8080/images/"));

        let hash = ImageStore::hash_from_url(&persisted.url).unwrap();
        let stored = store.get(hash).await.unwrap().unwrap();
        assert_eq!(stored.data, b"jpeg");
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_provider_url() {
        let sink = PersistenceSink::new(Arc::new(BrokenStorage), Client::new());

        let image = ImageRef::Bytes {
            data: b"abc".to_vec(),
            mime_type: "image/png".to_string(),
        };
        let persisted = sink.persist_image(&image, "generated").await;
        assert!(!persisted.durable);
        assert_eq!(persisted.url, "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn test_unreachable_url_is_returned_as_is() {
        let store = ImageStore::new(test_pool().await, "http://localhost:8080");
        let sink = PersistenceSink::new(Arc::new(store), Client::new());

        let image = ImageRef::Url("http://127.0.0.1:9/gone.png".to_string());
        let persisted = sink.persist_image(&image, "generated").await;
        assert!(!persisted.durable);
        assert_eq!(persisted.url, "http://127.0.0.1:9/gone.png");
    }
}
