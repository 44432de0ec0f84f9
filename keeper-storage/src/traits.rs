//! Core storage trait definitions.
//!
//! The `ObjectStorage` trait provides a unified interface for the places
//! Keeper ships sealed artifacts and manifest mirrors to (a local or
//! mounted directory, S3-compatible object storage).

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;
use crate::key::ObjectKey;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Full key of the object
    pub key: ObjectKey,
    /// Size in bytes
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds)
    pub last_modified: Option<i64>,
    /// ETag or content hash if available
    pub etag: Option<String>,
}

/// Remote storage for backup objects.
///
/// Only put/get/list/delete are required of a backend; everything else has
/// a default built on those.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` to allow concurrent access
/// from the per-class backup tasks.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write data to the specified key, overwriting any existing object.
    async fn put(&self, key: &ObjectKey, data: Bytes) -> Result<()>;

    /// Upload a local file to the specified key.
    async fn put_file(&self, key: &ObjectKey, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(data)).await
    }

    /// Read the object at the specified key.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the key does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Bytes>;

    /// Download the object at `key` into a local file.
    ///
    /// The file is written next to `path` first and renamed into place, so
    /// a failed download never leaves a truncated file at `path`.
    async fn get_to_file(&self, key: &ObjectKey, path: &Path) -> Result<u64> {
        let data = self.get(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, path).await?;
        Ok(data.len() as u64)
    }

    /// Check if an object exists.
    async fn exists(&self, key: &ObjectKey) -> Result<bool>;

    /// Delete the object at the specified key.
    ///
    /// No-op if the key does not exist (idempotent).
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// List objects under the given prefix key.
    async fn list(&self, prefix: &ObjectKey) -> Result<Vec<ObjectMeta>>;

    /// Get metadata for an object without reading its contents.
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta>;

    /// Human-readable location of `key`, recorded as an artifact's remote location.
    fn location(&self, key: &ObjectKey) -> String;

    /// Get a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ObjectKind;
    use crate::LocalStorage;
    use tempfile::TempDir;

    #[test]
    fn test_object_meta_debug() {
        let meta = ObjectMeta {
            key: ObjectKey::manifest("prod", "prod-20260101T000000Z-001"),
            size: 1024,
            last_modified: Some(1234567890),
            etag: Some("abc123".to_string()),
        };
        let debug = format!("{:?}", meta);
        assert!(debug.contains("prod"));
        assert!(debug.contains("1024"));
    }

    #[tokio::test]
    async fn test_put_file_get_to_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().join("remote"));
        let key = ObjectKey::artifact("prod", ObjectKind::Documents, "prod-1", "tar.zst");

        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"sealed container bytes").unwrap();
        storage.put_file(&key, &src).await.unwrap();

        let dst = dir.path().join("restore").join("dst.bin");
        let size = storage.get_to_file(&key, &dst).await.unwrap();
        assert_eq!(size, 22);
        assert_eq!(std::fs::read(&dst).unwrap(), b"sealed container bytes");
        assert!(!dst.with_extension("part").exists());
    }

    #[tokio::test]
    async fn test_get_to_file_missing_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        let key = ObjectKey::artifact("prod", ObjectKind::Metadata, "missing", "sql.zst");
        let dst = dir.path().join("out.bin");

        let err = storage.get_to_file(&key, &dst).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!dst.exists());
    }
}
