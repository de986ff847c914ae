//! Filesystem-backed object store.
//!
//! Keys map directly onto a directory tree under the configured root.
//! Presigned URLs point back at the API's storage proxy with an HMAC
//! signature over the key and expiry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::sign::sign_download;
use super::{validate_key, ObjectStore, StorageError, StorageResult};

pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_secret: Vec<u8>,
}

impl FsObjectStore {
    pub fn new(
        root: &Path,
        public_base_url: String,
        signing_secret: Vec<u8>,
    ) -> StorageResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret,
        })
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub fn signing_secret(&self) -> &[u8] {
        &self.signing_secret
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn upload_file(
        &self,
        key: &str,
        source: &Path,
        _content_type: &str,
    ) -> StorageResult<u64> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::copy(source, &path).await?)
    }

    async fn download(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download_to_file(&self, key: &str, dest: &Path) -> StorageResult<u64> {
        let path = self.object_path(key)?;
        match tokio::fs::copy(&path, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        validate_key(prefix.trim_end_matches('/'))?;
        let mut keys = Vec::new();
        let mut stack = vec![self.root.join(prefix.trim_end_matches('/'))];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> StorageResult<usize> {
        let mut removed = 0;
        for key in keys {
            let path = self.object_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        validate_key(key)?;
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;
        let sig = sign_download(&self.signing_secret, key, expires);
        let encoded: String = key
            .split('/')
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/api/storage/file/{}?expires={}&sig={}",
            self.public_base_url, encoded, expires, sig
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> FsObjectStore {
        FsObjectStore::new(dir, "http://localhost:8080".to_string(), b"secret".to_vec())
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .upload("ocr_jobs/j1/result.md", b"# hi".to_vec(), "text/markdown")
            .await
            .unwrap();
        let bytes = store.download("ocr_jobs/j1/result.md").await.unwrap();
        assert_eq!(bytes, b"# hi");
        assert!(store.exists("ocr_jobs/j1/result.md").await.unwrap());
        assert!(!store.exists("ocr_jobs/j1/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.download("nope/missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        for key in [
            "ocr_jobs/j1/result.md",
            "ocr_jobs/j1/crops/a.pdf",
            "ocr_jobs/j2/result.md",
        ] {
            store.upload(key, b"x".to_vec(), "text/plain").await.unwrap();
        }
        let keys = store.list_by_prefix("ocr_jobs/j1/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "ocr_jobs/j1/crops/a.pdf".to_string(),
                "ocr_jobs/j1/result.md".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_batch_counts_existing_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.upload("a/b", b"x".to_vec(), "text/plain").await.unwrap();
        let removed = store
            .delete_batch(&["a/b".to_string(), "a/missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_presign_produces_signed_proxy_url() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .upload("ocr_jobs/j1/result.zip", b"zip".to_vec(), "application/zip")
            .await
            .unwrap();
        let url = store
            .presign_get("ocr_jobs/j1/result.zip", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:8080/api/storage/file/ocr_jobs/"));
        assert!(url.contains("expires="));
        assert!(url.contains("sig="));
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let err = store.download("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
