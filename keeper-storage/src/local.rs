//! Directory-backed object storage.
//!
//! Used when the off-host target is a mounted directory (NFS, a second
//! disk) and as the backend of choice in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::key::ObjectKey;
use crate::traits::{ObjectMeta, ObjectStorage};

/// Objects laid out as `base_path/environment/kind/name`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// The base directory is created on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn to_fs_path(&self, key: &ObjectKey) -> Result<PathBuf> {
        key.validate()?;
        Ok(key.to_path_buf(&self.base_path))
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(dir) => Ok(fs::create_dir_all(dir).await?),
            None => Ok(()),
        }
    }

    fn meta_for(key: ObjectKey, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key,
            size: metadata.len(),
            last_modified: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64),
            etag: None,
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &ObjectKey, data: Bytes) -> Result<()> {
        let fs_path = self.to_fs_path(key)?;
        self.ensure_parent(&fs_path).await?;

        // Write-then-rename so readers never observe a half-written object.
        let tmp = fs_path.with_file_name(format!(".{}.tmp", key.name));
        debug!("Writing {} bytes to {:?}", data.len(), fs_path);
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &fs_path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, path = %path.display()))]
    async fn put_file(&self, key: &ObjectKey, path: &Path) -> Result<()> {
        let fs_path = self.to_fs_path(key)?;
        self.ensure_parent(&fs_path).await?;

        let tmp = fs_path.with_file_name(format!(".{}.tmp", key.name));
        debug!("Copying {:?} to {:?}", path, fs_path);
        fs::copy(path, &tmp).await?;
        fs::rename(&tmp, &fs_path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ObjectKey) -> Result<Bytes> {
        let fs_path = self.to_fs_path(key)?;
        debug!("Reading from {:?}", fs_path);

        match fs::read(&fs_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        let fs_path = self.to_fs_path(key)?;
        Ok(fs::try_exists(&fs_path).await?)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let fs_path = self.to_fs_path(key)?;
        debug!("Deleting {:?}", fs_path);

        match fs::remove_file(&fs_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &ObjectKey) -> Result<Vec<ObjectMeta>> {
        let dir_path = self.base_path.join(&prefix.environment).join(prefix.kind.as_str());
        let mut results = Vec::new();

        if !fs::try_exists(&dir_path).await? {
            return Ok(results);
        }

        self.list_recursive(&dir_path, &prefix.to_string(), &mut results)
            .await?;
        results.sort_by(|a, b| a.key.name.cmp(&b.key.name));

        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta> {
        let fs_path = self.to_fs_path(key)?;

        let metadata = match fs::metadata(&fs_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::meta_for(key.clone(), &metadata))
    }

    fn location(&self, key: &ObjectKey) -> String {
        format!("file://{}", key.to_path_buf(&self.base_path).display())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

impl LocalStorage {
    /// Walk `dir`, collecting every object whose key starts with `prefix`.
    #[async_recursion::async_recursion]
    async fn list_recursive(
        &self,
        dir: &Path,
        prefix: &str,
        results: &mut Vec<ObjectMeta>,
    ) -> Result<()> {
        let mut entries = fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                self.list_recursive(&path, prefix, results).await?;
            } else if metadata.is_file() {
                // In-flight temp files are not objects yet.
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }

                let relative = path
                    .strip_prefix(&self.base_path)
                    .map_err(|_| StorageError::InvalidKey(path.display().to_string()))?;
                let key_str = relative.to_string_lossy().replace('\\', "/");

                if key_str.starts_with(prefix) {
                    if let Some(key) = ObjectKey::parse(&key_str) {
                        results.push(Self::meta_for(key, &metadata));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ObjectKind;
    use tempfile::TempDir;

    fn offsite() -> (LocalStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalStorage::new(dir.path()), dir)
    }

    fn doc_key(id: &str) -> ObjectKey {
        ObjectKey::artifact("test", ObjectKind::Documents, id, "tar.zst")
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (storage, _temp) = offsite();

        let key = doc_key("test-1");
        storage.put(&key, Bytes::from_static(b"tarball")).await.unwrap();
        assert_eq!(&storage.get(&key).await.unwrap()[..], b"tarball");
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (storage, _temp) = offsite();

        let err = storage.get(&doc_key("never-written")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let (storage, _temp) = offsite();
        let key = doc_key("test-1");

        assert!(!storage.exists(&key).await.unwrap());
        storage.put(&key, Bytes::from("data")).await.unwrap();
        assert!(storage.exists(&key).await.unwrap());

        storage.delete(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (storage, _temp) = offsite();
        storage.delete(&doc_key("never-written")).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites_instead_of_duplicating() {
        let (storage, _temp) = offsite();
        let key = doc_key("test-1");

        storage.put(&key, Bytes::from("attempt 1")).await.unwrap();
        storage.put(&key, Bytes::from("attempt 2")).await.unwrap();

        let listed = storage
            .list(&ObjectKey::prefix("test", ObjectKind::Documents))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(storage.get(&key).await.unwrap(), Bytes::from("attempt 2"));
    }

    #[tokio::test]
    async fn test_list_scoped_to_kind_and_environment() {
        let (storage, _temp) = offsite();

        storage.put(&doc_key("b"), Bytes::from("bb")).await.unwrap();
        storage.put(&doc_key("a"), Bytes::from("a")).await.unwrap();
        storage
            .put(&ObjectKey::manifest("test", "a"), Bytes::from("{}"))
            .await
            .unwrap();
        storage
            .put(
                &ObjectKey::artifact("other", ObjectKind::Documents, "c", "tar.zst"),
                Bytes::from("ccc"),
            )
            .await
            .unwrap();

        let results = storage
            .list(&ObjectKey::prefix("test", ObjectKind::Documents))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key.name, "a.tar.zst");
        assert_eq!(results[1].key.name, "b.tar.zst");
        assert_eq!(results[1].size, 2);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let (storage, _temp) = offsite();
        let results = storage
            .list(&ObjectKey::prefix("nowhere", ObjectKind::Manifests))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_head_reports_size() {
        let (storage, temp) = offsite();
        let key = doc_key("test-1");
        let src = temp.path().join("container.bin");
        std::fs::write(&src, vec![0u8; 4096]).unwrap();

        storage.put_file(&key, &src).await.unwrap();
        let meta = storage.head(&key).await.unwrap();
        assert_eq!(meta.size, 4096);
        assert!(meta.last_modified.is_some());

        let missing = storage.head(&doc_key("missing")).await.unwrap_err();
        assert!(matches!(missing, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (storage, _temp) = offsite();
        let mut key = doc_key("x");
        key.environment = "..".to_string();
        let err = storage.put(&key, Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn test_location_and_backend_name() {
        let storage = LocalStorage::new("/mnt/offsite");
        assert_eq!(storage.backend_name(), "local");
        assert_eq!(
            storage.location(&doc_key("p-1")),
            "file:///mnt/offsite/test/documents/p-1.tar.zst"
        );
    }
}
