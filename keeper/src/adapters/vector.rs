//! Vector index directory adapter.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{archive, capture_directory, SourceAdapter};
use crate::artifact::{Artifact, ArtifactClass, ArtifactShape};
use crate::error::Result;
use crate::manifest::SnapshotId;
use crate::run_blocking;

/// Archives the vector index directory.
///
/// The index is fingerprinted before and after archiving; if a segment was
/// written in between the capture fails as `SourceUnavailable` and is retried.
/// Structural checks (required files, minimum file count) are verify policy,
/// not part of the adapter.
#[derive(Debug, Clone)]
pub struct VectorIndexAdapter {
    root: PathBuf,
}

impl VectorIndexAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceAdapter for VectorIndexAdapter {
    fn class(&self) -> ArtifactClass {
        ArtifactClass::VectorIndex
    }

    fn shape(&self) -> ArtifactShape {
        ArtifactShape::Archive
    }

    #[instrument(skip(self, cancel), fields(root = %self.root.display()))]
    async fn capture(
        &self,
        snapshot_id: &SnapshotId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        capture_directory(ArtifactClass::VectorIndex, &self.root, snapshot_id, dest, true, cancel).await
    }

    #[instrument(skip(self, artifact), fields(snapshot_id = %artifact.snapshot_id))]
    async fn restore(&self, artifact: &Artifact, raw: &Path) -> Result<()> {
        let raw = raw.to_path_buf();
        let root = self.root.clone();
        let stats = run_blocking(move || archive::unpack_replace(&raw, &root)).await?;
        info!(files = stats.files, "Vector index restored");
        Ok(())
    }
}
