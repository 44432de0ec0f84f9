//! Artifact source adapters.
//!
//! Each adapter owns exactly one store and knows how to capture it into a
//! single local file and how to restore it from one. The coordinator only
//! talks to the `SourceAdapter` trait.

pub mod archive;
mod documents;
mod metadata;
mod vector;

pub use documents::DocumentsAdapter;
pub use metadata::RelationalDumpAdapter;
pub use vector::VectorIndexAdapter;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::artifact::{Artifact, ArtifactClass, ArtifactShape};
use crate::config::SourcesConfig;
use crate::error::{Error, Result};
use crate::manifest::SnapshotId;
use crate::run_blocking;

/// Capture/restore capability for one store.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn class(&self) -> ArtifactClass;

    fn shape(&self) -> ArtifactShape;

    /// Capture the store into `dest` (a file path that does not exist yet).
    /// Once `cancel` fires the capture stops and leaves nothing at `dest`.
    ///
    /// # Errors
    ///
    /// `SourceUnavailable` when the store cannot be reached (retryable),
    /// `CaptureCorrupt` when the capture completed but is unusable,
    /// `Cancelled` when stopped through `cancel`.
    async fn capture(
        &self,
        snapshot_id: &SnapshotId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Artifact>;

    /// Restore the store from the raw (unsealed) capture at `raw`.
    async fn restore(&self, artifact: &Artifact, raw: &Path) -> Result<()>;
}

/// Adapters keyed by class.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: BTreeMap<ArtifactClass, Arc<dyn SourceAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.class(), adapter);
    }

    pub fn get(&self, class: ArtifactClass) -> Result<Arc<dyn SourceAdapter>> {
        self.adapters.get(&class).cloned().ok_or_else(|| {
            Error::Config(format!("No source configured for class {}", class))
        })
    }

    pub fn classes(&self) -> Vec<ArtifactClass> {
        self.adapters.keys().copied().collect()
    }

    /// Build the adapters described by `[sources]`.
    pub fn from_config(config: &SourcesConfig) -> Self {
        let mut set = Self::new();
        if let Some(meta) = &config.metadata {
            set.insert(Arc::new(RelationalDumpAdapter::from_config(meta)));
        }
        if let Some(docs) = &config.documents {
            set.insert(Arc::new(DocumentsAdapter::new(&docs.path)));
        }
        if let Some(vector) = &config.vector_index {
            set.insert(Arc::new(VectorIndexAdapter::new(&vector.path)));
        }
        set
    }
}

/// Archive a directory store into `dest`. With `require_stable`, the tree is
/// fingerprinted before and after packing and a change fails the capture.
///
/// The archive is packed into a private partial file and only renamed onto
/// `dest` by a live attempt. Dropping this future cancels the packer, which
/// then removes its own partial file.
pub(crate) async fn capture_directory(
    class: ArtifactClass,
    root: &Path,
    snapshot_id: &SnapshotId,
    dest: &Path,
    require_stable: bool,
    cancel: &CancellationToken,
) -> Result<Artifact> {
    let root: PathBuf = root.to_path_buf();
    let dest: PathBuf = dest.to_path_buf();
    let snapshot_id = snapshot_id.clone();
    let attempt = cancel.child_token();
    let _stop_on_drop = attempt.clone().drop_guard();

    run_blocking(move || {
        if !root.is_dir() {
            return Err(Error::SourceUnavailable(format!(
                "{} directory {} is not accessible",
                class,
                root.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(&dest);

        let packed = pack_stable(class, &root, &partial, require_stable, &attempt).and_then(|stats| {
            if attempt.is_cancelled() {
                return Err(Error::Cancelled);
            }
            std::fs::rename(&partial, &dest)?;
            Ok(stats)
        });
        let stats = match packed {
            Ok(stats) => stats,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };

        debug!(%class, files = stats.files, bytes = stats.bytes, "Directory archived");
        Artifact::from_capture(class, snapshot_id, ArtifactShape::Archive, dest, Utc::now())
    })
    .await
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.partial", name, uuid::Uuid::new_v4()))
}

fn pack_stable(
    class: ArtifactClass,
    root: &Path,
    dest: &Path,
    require_stable: bool,
    cancel: &CancellationToken,
) -> Result<archive::PackStats> {
    let before = if require_stable {
        Some(fingerprint(root)?)
    } else {
        None
    };

    let stats = archive::pack(root, dest, cancel).map_err(|e| match e {
        // Files vanishing mid-walk means the store is being written
        Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            Error::SourceUnavailable(format!("{} changed during capture: {}", class, io))
        }
        other => other,
    })?;

    if let Some(before) = before {
        if fingerprint(root)? != before {
            return Err(Error::SourceUnavailable(format!(
                "{} at {} was modified during capture",
                class,
                root.display()
            )));
        }
    }
    Ok(stats)
}

type Fingerprint = Vec<(String, u64, Option<std::time::SystemTime>)>;

fn fingerprint(root: &Path) -> Result<Fingerprint> {
    Ok(archive::walk(root)?
        .into_iter()
        .map(|e| (e.relative, e.size, if e.is_dir { None } else { e.modified }))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_adapter_set_lookup() {
        let set = AdapterSet::new().with(Arc::new(DocumentsAdapter::new("/srv/docs")));
        assert_eq!(set.classes(), vec![ArtifactClass::Documents]);
        assert!(set.get(ArtifactClass::Documents).is_ok());
        assert!(matches!(set.get(ArtifactClass::Metadata), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_capture_missing_directory_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let id = SnapshotId::parse("prod-20260101T020000Z-001").unwrap();
        let err = capture_directory(
            ArtifactClass::Documents,
            &temp.path().join("missing"),
            &id,
            &temp.path().join("out.tar"),
            false,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable(_)));
        assert!(err.is_retryable());
    }
}
