pub mod adapters;
pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod publish;
pub mod quiesce;
pub mod retention;
pub mod retry;
pub mod seal;
pub mod verify;

pub use artifact::{Artifact, ArtifactClass, ArtifactShape};
pub use config::Config;
pub use coordinator::{
    BackupReport, BackupRequest, Coordinator, CoordinatorBuilder, RestoreReport, RestoreRequest,
    VerifyReport,
};
pub use error::{Error, Result};
pub use manifest::{ManifestStatus, SnapshotId, SnapshotManifest};
pub use retention::{PruneReport, RetentionPolicy};

/// Run blocking filesystem or CPU work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("blocking task failed: {}", e))))?
}
