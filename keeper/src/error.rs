use std::time::Duration;
use thiserror::Error;

use crate::manifest::{FailureKind, ManifestStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Capture corrupt: {0}")]
    CaptureCorrupt(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Seal failed: {0}")]
    SealFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    #[error("Application did not drain within {0:?}")]
    QuiesceTimeout(Duration),

    #[error("Quiesce error: {0}")]
    Quiesce(String),

    #[error("Consistency window violated: {0}")]
    ConsistencyWindow(String),

    #[error("Snapshot {snapshot_id} is {status}; not restorable for: {classes}")]
    ManifestNotComplete {
        snapshot_id: String,
        status: ManifestStatus,
        classes: String,
    },

    #[error("Retention conflict: {0}")]
    RetentionConflict(String),

    #[error("Environment '{environment}' is locked by {holder}")]
    LockContention { environment: String, holder: String },

    #[error("{stage} timed out after {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid snapshot id: {0}")]
    InvalidSnapshotId(String),

    #[error("Manifest {0} is finalized and cannot be rewritten")]
    ManifestFinalized(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] keeper_storage::StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failing operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SourceUnavailable(_) => true,
            Error::Storage(e) => e.is_transient(),
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Classification recorded in manifests and reports.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::SourceUnavailable(_) => FailureKind::SourceUnavailable,
            Error::CaptureCorrupt(_) => FailureKind::CaptureCorrupt,
            Error::VerificationFailed(_) => FailureKind::VerificationFailed,
            Error::SealFailed(_) => FailureKind::SealFailed,
            Error::PublishFailed(_) => FailureKind::PublishFailed,
            Error::RestoreFailed(_) => FailureKind::RestoreFailed,
            Error::QuiesceTimeout(_) | Error::Quiesce(_) => FailureKind::QuiesceTimeout,
            Error::ConsistencyWindow(_) => FailureKind::ConsistencyWindow,
            Error::StageTimeout { .. } => FailureKind::StageTimeout,
            Error::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }
}
