//! Remote (off-host) storage configuration.
//!
//! # Configuration Examples
//!
//! ## Mounted directory
//!
//! ```toml
//! [remote]
//! backend = "local"
//! path = "/mnt/offsite/keeper"
//! ```
//!
//! ## S3
//!
//! ```toml
//! [remote]
//! backend = "s3"
//!
//! [remote.s3]
//! bucket = "dms-backups"
//! region = "eu-west-1"
//! prefix = "keeper/"
//! ```
//!
//! ## MinIO / S3-Compatible
//!
//! ```toml
//! [remote]
//! backend = "s3"
//!
//! [remote.s3]
//! bucket = "backups"
//! endpoint = "http://localhost:9000"
//! force_path_style = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use keeper_storage::{LocalStorage, ObjectStorage};

use crate::error::{Error, Result};

/// Remote storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteStorageConfig {
    /// Backend type: "none", "local" or "s3"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Target directory for the "local" backend
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// S3 configuration (for the "s3" backend)
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

fn default_backend() -> String {
    "none".to_string()
}

/// S3-compatible storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3StorageConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Optional prefix for all keys
    #[serde(default)]
    pub prefix: Option<String>,

    /// Custom endpoint (for MinIO, etc.)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style requests (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,

    /// Access key ID (optional, uses AWS credential chain if not set)
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for RemoteStorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            s3: None,
        }
    }
}

impl RemoteStorageConfig {
    /// Build the configured backend, or `None` when no remote is configured.
    pub fn create_storage(&self) -> Result<Option<Arc<dyn ObjectStorage>>> {
        match self.backend.as_str() {
            "none" | "" => Ok(None),
            "local" => {
                let path = self.path.as_ref().ok_or_else(|| {
                    Error::Config("Local remote backend requires [remote] path".into())
                })?;
                Ok(Some(Arc::new(LocalStorage::new(path))))
            }
            #[cfg(feature = "storage-s3")]
            "s3" => {
                let s3_config = self.s3.as_ref().ok_or_else(|| {
                    Error::Config("S3 backend requires [remote.s3] configuration".into())
                })?;

                use keeper_storage::{S3Config, S3Storage};

                let mut config = S3Config::new(&s3_config.bucket, &s3_config.region);
                if let Some(endpoint) = &s3_config.endpoint {
                    config = config.with_endpoint(endpoint);
                }
                config.force_path_style |= s3_config.force_path_style;

                if let Some(prefix) = &s3_config.prefix {
                    config = config.with_prefix(prefix);
                }

                if let (Some(key_id), Some(secret)) =
                    (&s3_config.access_key_id, &s3_config.secret_access_key)
                {
                    config = config.with_credentials(key_id, secret);
                }

                Ok(Some(Arc::new(S3Storage::new(config)?)))
            }
            #[cfg(not(feature = "storage-s3"))]
            "s3" => Err(Error::Config(
                "S3 storage requires the 'storage-s3' feature".into(),
            )),
            other => Err(Error::Config(format!(
                "Unknown remote backend: '{}'. Valid options: none, local, s3",
                other
            ))),
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self.backend.as_str(), "none" | "")
    }

    /// Expand ~ in all paths.
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(ref path) = self.path {
            self.path = Some(crate::config::expand_tilde(path)?);
        }
        Ok(())
    }
}
