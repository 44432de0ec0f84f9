//! Remote publication of verified artifacts.

use keeper_storage::{ObjectKey, ObjectStorage};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::artifact::Artifact;
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry::RetryPolicy;

/// Uploads artifacts under `{environment}/{class}/{snapshot_id}.{ext}`.
///
/// The key depends only on the snapshot and class, so a retried upload
/// overwrites the same object rather than adding a second one.
#[derive(Clone)]
pub struct RemotePublisher {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
}

impl RemotePublisher {
    pub fn new(storage: Arc<dyn ObjectStorage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Remote key of an artifact as currently sealed.
    pub fn key_for(artifact: &Artifact) -> ObjectKey {
        ObjectKey::artifact(
            artifact.snapshot_id.environment(),
            artifact.class.object_kind(),
            artifact.snapshot_id.as_str(),
            &artifact.extension(),
        )
    }

    /// Upload `artifact` and return it with `remote_location` set.
    ///
    /// # Errors
    ///
    /// `PublishFailed` when the artifact is unverified, or after the retry
    /// budget is exhausted. The local copy is left untouched either way.
    #[instrument(skip(self, artifact), fields(class = %artifact.class, snapshot_id = %artifact.snapshot_id))]
    pub async fn publish(&self, artifact: &Artifact) -> Result<Artifact> {
        if !artifact.verified {
            return Err(Error::PublishFailed(format!(
                "{} artifact of {} is not verified",
                artifact.class, artifact.snapshot_id
            )));
        }
        if artifact.remote_location.is_some() {
            return Ok(artifact.clone());
        }

        let key = Self::key_for(artifact);
        let class = artifact.class;
        let path = artifact.local_path.clone();
        let expected = artifact.size_bytes;
        let storage = Arc::clone(&self.storage);

        let uploaded = self
            .retry
            .run(
                "publish",
                |_attempt| {
                    let storage = Arc::clone(&storage);
                    let key = key.clone();
                    let path = path.clone();
                    async move {
                        storage.put_file(&key, &path).await?;
                        let meta = storage.head(&key).await?;
                        if meta.size != expected {
                            return Err(Error::PublishFailed(format!(
                                "remote object {} has {} bytes, expected {}",
                                key, meta.size, expected
                            )));
                        }
                        Ok(())
                    }
                },
                |attempt, outcome| {
                    metrics::record_publish_attempt(class, outcome.is_ok());
                    if let Err(e) = outcome {
                        warn!(attempt, error = %e, "Upload attempt failed");
                    }
                },
            )
            .await;

        if let Err(e) = uploaded {
            return Err(match e {
                Error::PublishFailed(_) | Error::Cancelled => e,
                other => Error::PublishFailed(other.to_string()),
            });
        }

        let location = self.storage.location(&key);
        let mut published = artifact.clone();
        published.set_remote_location(location.clone())?;
        info!(%location, size = expected, "Artifact published");
        Ok(published)
    }

    /// Download a published artifact's container to `dest`.
    #[instrument(skip(self, artifact), fields(class = %artifact.class, snapshot_id = %artifact.snapshot_id))]
    pub async fn fetch(&self, artifact: &Artifact, dest: &std::path::Path) -> Result<u64> {
        if artifact.remote_location.is_none() {
            return Err(Error::RestoreFailed(format!(
                "{} artifact of {} was never published",
                artifact.class, artifact.snapshot_id
            )));
        }
        let key = Self::key_for(artifact);
        let storage = Arc::clone(&self.storage);
        self.retry
            .run(
                "fetch",
                |_attempt| {
                    let storage = Arc::clone(&storage);
                    let key = key.clone();
                    async move { Ok(storage.get_to_file(&key, dest).await?) }
                },
                |_, _| {},
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactClass, ArtifactShape};
    use crate::manifest::SnapshotId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use keeper_storage::{LocalStorage, ObjectMeta, StorageError};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn artifact(temp: &Path) -> Artifact {
        let path = temp.join("local/prod-20260101T020000Z-001.dump");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"CREATE TABLE t();").unwrap();
        let mut a = Artifact::from_capture(
            ArtifactClass::Metadata,
            SnapshotId::parse("prod-20260101T020000Z-001").unwrap(),
            ArtifactShape::Stream,
            path,
            Utc::now(),
        )
        .unwrap();
        a.verified = true;
        a
    }

    /// Fails the first `failures` puts with a transient error.
    struct Flaky {
        inner: LocalStorage,
        failures: u32,
        puts: AtomicU32,
    }

    #[async_trait]
    impl ObjectStorage for Flaky {
        async fn put(&self, key: &ObjectKey, data: Bytes) -> keeper_storage::Result<()> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(StorageError::Backend("connection reset".into()));
            }
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &ObjectKey) -> keeper_storage::Result<Bytes> {
            self.inner.get(key).await
        }
        async fn exists(&self, key: &ObjectKey) -> keeper_storage::Result<bool> {
            self.inner.exists(key).await
        }
        async fn delete(&self, key: &ObjectKey) -> keeper_storage::Result<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &ObjectKey) -> keeper_storage::Result<Vec<ObjectMeta>> {
            self.inner.list(prefix).await
        }
        async fn head(&self, key: &ObjectKey) -> keeper_storage::Result<ObjectMeta> {
            self.inner.head(key).await
        }
        fn location(&self, key: &ObjectKey) -> String {
            self.inner.location(key)
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_publish_sets_location_once() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(LocalStorage::new(temp.path().join("remote")));
        let publisher = RemotePublisher::new(remote.clone(), retry(3));

        let published = publisher.publish(&artifact(temp.path())).await.unwrap();
        let location = published.remote_location.clone().unwrap();
        assert!(location.contains("prod/metadata/prod-20260101T020000Z-001.dump"));

        // Publishing again is a no-op
        let again = publisher.publish(&published).await.unwrap();
        assert_eq!(again.remote_location, Some(location));
        let objects = remote
            .list(&ObjectKey::prefix("prod", keeper_storage::ObjectKind::Metadata))
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn test_unverified_is_refused() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(LocalStorage::new(temp.path().join("remote")));
        let mut a = artifact(temp.path());
        a.verified = false;
        let err = RemotePublisher::new(remote, retry(3)).publish(&a).await.unwrap_err();
        assert!(matches!(err, Error::PublishFailed(_)));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_to_one_object() {
        let temp = TempDir::new().unwrap();
        let flaky = Arc::new(Flaky {
            inner: LocalStorage::new(temp.path().join("remote")),
            failures: 2,
            puts: AtomicU32::new(0),
        });
        let publisher = RemotePublisher::new(flaky.clone(), retry(4));
        let published = publisher.publish(&artifact(temp.path())).await.unwrap();
        assert!(published.remote_location.is_some());
        assert_eq!(flaky.puts.load(Ordering::SeqCst), 3);

        let objects = flaky
            .list(&ObjectKey::prefix("prod", keeper_storage::ObjectKind::Metadata))
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_leave_local_copy() {
        let temp = TempDir::new().unwrap();
        let flaky = Arc::new(Flaky {
            inner: LocalStorage::new(temp.path().join("remote")),
            failures: u32::MAX,
            puts: AtomicU32::new(0),
        });
        let a = artifact(temp.path());
        let err = RemotePublisher::new(flaky.clone(), retry(3))
            .publish(&a)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishFailed(_)));
        assert_eq!(flaky.puts.load(Ordering::SeqCst), 3);
        assert!(a.local_path.exists());
    }

    #[tokio::test]
    async fn test_fetch_roundtrip() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(LocalStorage::new(temp.path().join("remote")));
        let publisher = RemotePublisher::new(remote, retry(2));
        let published = publisher.publish(&artifact(temp.path())).await.unwrap();

        let dest = temp.path().join("fetched.dump");
        let n = publisher.fetch(&published, &dest).await.unwrap();
        assert_eq!(n, published.size_bytes);
        assert_eq!(
            std::fs::read(&dest).unwrap(),
            std::fs::read(&published.local_path).unwrap()
        );
    }
}
