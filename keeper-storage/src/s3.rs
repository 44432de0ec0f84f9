//! S3-compatible object storage backend.
//!
//! Uses the `object_store` crate for S3, MinIO, and other S3-compatible services.
//!
//! # Configuration
//!
//! ```toml
//! [remote]
//! backend = "s3"
//!
//! [remote.s3]
//! bucket = "dms-backups"
//! region = "eu-west-1"
//! prefix = "keeper/"
//!
//! # Optional: For MinIO or other S3-compatible services
//! endpoint = "http://localhost:9000"
//! force_path_style = true
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::key::ObjectKey;
use crate::traits::{ObjectMeta, ObjectStorage};

/// Bucket, endpoint and credentials of an S3-compatible remote.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Key prefix inside the bucket, e.g. `keeper/`
    pub prefix: Option<String>,
    /// Non-AWS endpoint (MinIO, Ceph RGW, ...)
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    /// Static credentials; the AWS environment/instance chain is used otherwise
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            prefix: None,
            endpoint: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
        }
    }

    /// Point at a self-hosted endpoint. Those need path-style addressing, and
    /// plain HTTP is allowed only when the endpoint itself says so.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.allow_http = endpoint.starts_with("http://");
        self.force_path_style = true;
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_credentials(mut self, key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.access_key_id = Some(key_id.into());
        self.secret_access_key = Some(secret.into());
        self
    }
}

/// S3-compatible object storage backend.
#[derive(Clone)]
pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub fn new(config: S3Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        if config.force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key_id)
                .with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket,
            prefix: config.prefix.unwrap_or_default(),
        })
    }

    /// Wrap an already built store (tests use `InMemory`).
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: String, prefix: String) -> Self {
        Self {
            store,
            bucket,
            prefix,
        }
    }

    /// Convert ObjectKey to object_store Path.
    fn to_object_path(&self, key: &ObjectKey) -> ObjectPath {
        let key_str = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        };
        ObjectPath::from(key_str)
    }

    /// Convert object_store Path back to ObjectKey.
    fn from_object_path(&self, obj_path: &ObjectPath) -> Option<ObjectKey> {
        let path_str = obj_path.as_ref();
        let prefix = self.prefix.trim_end_matches('/');
        let relative = if !prefix.is_empty() {
            path_str.strip_prefix(prefix)?.trim_start_matches('/')
        } else {
            path_str
        };
        ObjectKey::parse(relative)
    }

    fn not_found_or(key: &ObjectKey, e: object_store::Error) -> StorageError {
        match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
            other => StorageError::from(other),
        }
    }
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &ObjectKey, data: Bytes) -> Result<()> {
        key.validate()?;
        let obj_path = self.to_object_path(key);
        debug!("Writing {} bytes to s3://{}/{}", data.len(), self.bucket, obj_path);

        self.store
            .put(&obj_path, data.into())
            .await
            .map_err(StorageError::from)?;

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &ObjectKey) -> Result<Bytes> {
        let obj_path = self.to_object_path(key);
        debug!("Reading from s3://{}/{}", self.bucket, obj_path);

        let result = self
            .store
            .get(&obj_path)
            .await
            .map_err(|e| Self::not_found_or(key, e))?;
        result.bytes().await.map_err(StorageError::from)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        let obj_path = self.to_object_path(key);

        match self.store.head(&obj_path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::from(e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let obj_path = self.to_object_path(key);
        debug!("Deleting s3://{}/{}", self.bucket, obj_path);

        match self.store.delete(&obj_path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::from(e)),
        }
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &ObjectKey) -> Result<Vec<ObjectMeta>> {
        use futures::TryStreamExt;

        let obj_prefix = self.to_object_path(&ObjectKey::prefix(
            prefix.environment.clone(),
            prefix.kind,
        ));
        debug!("Listing s3://{}/{}", self.bucket, obj_prefix);

        let mut results = Vec::new();
        let mut stream = self.store.list(Some(&obj_prefix));

        while let Some(meta) = stream.try_next().await.map_err(StorageError::from)? {
            if let Some(key) = self.from_object_path(&meta.location) {
                if !prefix.is_prefix() && key.name != prefix.name {
                    continue;
                }
                results.push(ObjectMeta {
                    key,
                    size: meta.size as u64,
                    last_modified: Some(meta.last_modified.timestamp()),
                    etag: meta.e_tag.clone(),
                });
            }
        }
        results.sort_by(|a, b| a.key.name.cmp(&b.key.name));

        Ok(results)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta> {
        let obj_path = self.to_object_path(key);

        let meta = self
            .store
            .head(&obj_path)
            .await
            .map_err(|e| Self::not_found_or(key, e))?;
        Ok(ObjectMeta {
            key: key.clone(),
            size: meta.size as u64,
            last_modified: Some(meta.last_modified.timestamp()),
            etag: meta.e_tag,
        })
    }

    fn location(&self, key: &ObjectKey) -> String {
        format!("s3://{}/{}", self.bucket, self.to_object_path(key))
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ObjectKind;

    fn in_memory(prefix: &str) -> S3Storage {
        S3Storage::from_store(
            Arc::new(object_store::memory::InMemory::new()),
            "bucket".to_string(),
            prefix.to_string(),
        )
    }

    #[test]
    fn test_endpoint_switches_addressing() {
        let aws = S3Config::new("dms-backups", "eu-west-1");
        assert!(!aws.force_path_style && !aws.allow_http);

        let minio = S3Config::new("dms-backups", "us-east-1").with_endpoint("http://minio:9000");
        assert!(minio.force_path_style);
        assert!(minio.allow_http);

        let rgw = S3Config::new("dms-backups", "us-east-1").with_endpoint("https://rgw.internal");
        assert!(!rgw.allow_http);
    }

    #[test]
    fn test_to_object_path_with_prefix() {
        let storage = in_memory("keeper/");
        let key = ObjectKey::manifest("prod", "prod-1");
        assert_eq!(
            storage.to_object_path(&key).as_ref(),
            "keeper/prod/manifests/prod-1.json"
        );
        assert_eq!(storage.location(&key), "s3://bucket/keeper/prod/manifests/prod-1.json");
    }

    #[test]
    fn test_from_object_path() {
        let storage = in_memory("keeper/");
        let obj_path = ObjectPath::from("keeper/prod/vector_index/prod-1.tar.zst");
        let key = storage.from_object_path(&obj_path).unwrap();

        assert_eq!(key.environment, "prod");
        assert_eq!(key.kind, ObjectKind::VectorIndex);
        assert_eq!(key.name, "prod-1.tar.zst");
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip_and_list() {
        let storage = in_memory("");
        let a = ObjectKey::artifact("prod", ObjectKind::Metadata, "prod-1", "sql.zst");
        let b = ObjectKey::artifact("prod", ObjectKind::Metadata, "prod-2", "sql.zst");

        storage.put(&a, Bytes::from("one")).await.unwrap();
        storage.put(&b, Bytes::from("two")).await.unwrap();
        storage.put(&a, Bytes::from("one again")).await.unwrap();

        let listed = storage
            .list(&ObjectKey::prefix("prod", ObjectKind::Metadata))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(storage.get(&a).await.unwrap(), Bytes::from("one again"));

        storage.delete(&a).await.unwrap();
        storage.delete(&a).await.unwrap();
        assert!(!storage.exists(&a).await.unwrap());
        assert!(storage.get(&a).await.unwrap_err().is_not_found());
    }

    // Integration tests require actual S3/MinIO - run with:
    // cargo test -p keeper-backup-storage --features s3 -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_s3_integration() {
        let config = S3Config::new("test-bucket", "us-east-1")
            .with_endpoint("http://localhost:9000")
            .with_credentials("minioadmin", "minioadmin");

        let storage = S3Storage::new(config).unwrap();
        let key = ObjectKey::manifest("it", "it-integration");
        let data = Bytes::from("integration test data");

        storage.put(&key, data.clone()).await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap(), data);
        assert!(storage.exists(&key).await.unwrap());
        storage.delete(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
    }
}
