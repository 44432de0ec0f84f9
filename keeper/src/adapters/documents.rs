//! Document blob directory adapter.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{archive, capture_directory, SourceAdapter};
use crate::artifact::{Artifact, ArtifactClass, ArtifactShape};
use crate::error::Result;
use crate::manifest::SnapshotId;
use crate::run_blocking;

/// Archives the document directory as a deterministic tar.
#[derive(Debug, Clone)]
pub struct DocumentsAdapter {
    root: PathBuf,
}

impl DocumentsAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SourceAdapter for DocumentsAdapter {
    fn class(&self) -> ArtifactClass {
        ArtifactClass::Documents
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
        capture_directory(ArtifactClass::Documents, &self.root, snapshot_id, dest, false, cancel).await
    }

    #[instrument(skip(self, artifact), fields(snapshot_id = %artifact.snapshot_id))]
    async fn restore(&self, artifact: &Artifact, raw: &Path) -> Result<()> {
        let raw = raw.to_path_buf();
        let root = self.root.clone();
        let stats = run_blocking(move || archive::unpack_replace(&raw, &root)).await?;
        info!(files = stats.files, bytes = stats.bytes, "Documents restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_capture_then_restore_reproduces_checksum() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("documents");
        fs::create_dir_all(root.join("2026/01")).unwrap();
        fs::write(root.join("2026/01/invoice.pdf"), b"%PDF-1.7 fake").unwrap();
        fs::write(root.join("readme.txt"), b"hello").unwrap();

        let adapter = DocumentsAdapter::new(&root);
        let id = SnapshotId::parse("prod-20260101T020000Z-001").unwrap();
        let first = adapter
            .capture(&id, &temp.path().join("out/first.tar"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.class, ArtifactClass::Documents);
        assert!(!first.verified);

        // Damage the live store, then restore over it
        fs::remove_file(root.join("readme.txt")).unwrap();
        fs::write(root.join("junk.tmp"), b"junk").unwrap();
        adapter.restore(&first, &first.local_path).await.unwrap();
        assert!(!root.join("junk.tmp").exists());
        assert_eq!(fs::read(root.join("readme.txt")).unwrap(), b"hello");

        let second = adapter
            .capture(&id, &temp.path().join("out/second.tar"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.checksum, second.checksum);
    }
}
