//! Object store adapter.
//!
//! All artifact bytes live in an object store addressed by UTF-8 keys under
//! per-job prefixes. Two backends, selected by URL scheme the same way the
//! database picks sqlite vs postgres:
//!
//! - `file://` (or a bare path): local filesystem tree, presigned URLs are
//!   HMAC-signed expiring links served back through the API's storage proxy.
//! - `s3://bucket` plus an endpoint: any S3-compatible store via SigV4.
//!
//! Writes are last-write-wins; no versioning is assumed.

mod fs;
mod s3;
pub mod sign;

pub use fs::FsObjectStore;
pub use s3::S3ObjectStore;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Settings;

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage request failed ({status}): {message}")]
    Request { status: u16, message: String },
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Capability contract every storage backend implements.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a byte buffer.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<()>;

    /// Upload from a file on disk without buffering it whole.
    async fn upload_file(&self, key: &str, path: &Path, content_type: &str)
        -> StorageResult<u64>;

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Download to a file on disk, returning the byte count.
    async fn download_to_file(&self, key: &str, path: &Path) -> StorageResult<u64>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete many keys; returns how many were removed. Missing keys are not
    /// an error.
    async fn delete_batch(&self, keys: &[String]) -> StorageResult<usize>;

    /// A time-limited GET URL a client can use without credentials.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    async fn upload_text(&self, key: &str, text: &str) -> StorageResult<()> {
        self.upload(key, text.as_bytes().to_vec(), "text/plain; charset=utf-8")
            .await
    }

    async fn download_text(&self, key: &str) -> StorageResult<String> {
        let bytes = self.download(key).await?;
        String::from_utf8(bytes)
            .map_err(|e| StorageError::Unavailable(format!("object is not UTF-8: {}", e)))
    }
}

/// Reject traversal and absolute keys before they reach a backend.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Build the configured storage backend.
pub fn from_settings(settings: &Settings) -> StorageResult<Arc<dyn ObjectStore>> {
    let url = settings.storage_url.trim();
    if let Some(rest) = url.strip_prefix("s3://") {
        let bucket = rest.trim_end_matches('/');
        if bucket.is_empty() {
            return Err(StorageError::Unavailable(
                "s3 storage URL is missing a bucket".to_string(),
            ));
        }
        let endpoint = settings.s3_endpoint.clone().ok_or_else(|| {
            StorageError::Unavailable("s3 storage requires REMOCR_S3_ENDPOINT".to_string())
        })?;
        Ok(Arc::new(S3ObjectStore::new(
            endpoint,
            bucket.to_string(),
            settings.s3_region.clone(),
            settings.s3_access_key.clone().unwrap_or_default(),
            settings.s3_secret_key.clone().unwrap_or_default(),
        )?))
    } else {
        let root = url.strip_prefix("file://").unwrap_or(url);
        Ok(Arc::new(FsObjectStore::new(
            Path::new(root),
            settings.public_base_url.clone(),
            settings.signing_secret.as_bytes().to_vec(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("ocr_jobs/abc/result.md").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a/./b").is_err());
    }
}
