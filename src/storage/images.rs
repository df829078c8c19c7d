//! SQLite-backed object storage for generated portraits
//!
//! Rows are keyed by the SHA-256 of their bytes and reference counted: the
//! same portrait saved twice is one row with `reference_count = 2`, and deleting an
//! asset only drops the bytes once nothing else points at them.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::debug;

use super::{ObjectStorage, StorageError};

/// Stored bytes with their content type
#[derive(Debug, Clone)]
pub struct ImageData {
    pub hash: String,
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Content-addressed image store
#[derive(Clone)]
pub struct ImageStore {
    pool: SqlitePool,
    public_url: String,
}

impl ImageStore {
    /// Create a new image store serving under `public_url`/images
    pub fn new(pool: SqlitePool, public_url: &str) -> Self {
        Self {
            pool,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    fn content_key(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Public URL for a stored hash
    pub fn url_for(&self, hash: &str) -> String {
        format!("{}/images/{}", self.public_url, hash)
    }

    /// Extract the hash from a URL produced by [`ImageStore::url_for`]
    pub fn hash_from_url(url: &str) -> Option<&str> {
        let (_, hash) = url.rsplit_once("/images/")?;
        (hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())).then_some(hash)
    }

    /// Save bytes, or take another reference to an identical row
    pub async fn store(&self, data: &[u8], mime_type: &str, folder: &str) -> Result<String, StorageError> {
        let hash = Self::content_key(data);
        let created_at = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO image_store (hash, data, mime_type, size_bytes, folder, created_at) VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(hash) DO UPDATE SET reference_count = reference_count + 1",
        )
        .bind(&hash)
        .bind(data)
        .bind(mime_type)
        .bind(data.len() as i64)
        .bind(folder)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        debug!("Stored image with hash {} ({} bytes)", hash, data.len());
        Ok(hash)
    }

    pub async fn get(&self, hash: &str) -> Result<Option<ImageData>, StorageError> {
        let row: Option<(String, Vec<u8>, String)> =
            sqlx::query_as("SELECT hash, data, mime_type FROM image_store WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(hash, data, mime_type)| ImageData {
            hash,
            data,
            mime_type,
        }))
    }

    /// Drop one reference; the row goes once nothing points at it
    pub async fn release(&self, hash: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE image_store SET reference_count = reference_count - 1 WHERE hash = ?")
            .bind(hash)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM image_store WHERE hash = ? AND reference_count <= 0")
            .bind(hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() > 0 {
            debug!("Deleted image with hash {}", hash);
            Ok(true)
        } else {
            debug!("Image {} kept (still referenced or missing)", hash);
            Ok(false)
        }
    }
}

#[async_trait]
impl ObjectStorage for ImageStore {
    async fn put(&self, folder: &str, data: &[u8], mime_type: &str) -> Result<String, StorageError> {
        let hash = self.store(data, mime_type, folder).await?;
        Ok(self.url_for(&hash))
    }
}
