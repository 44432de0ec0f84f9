//! Run-lock serialization and retention behaviour across several backup runs
//! of one environment.

use async_trait::async_trait;
use keeper::adapters::{DocumentsAdapter, SourceAdapter};
use keeper::artifact::{Artifact, ArtifactShape};
use keeper::lock::RunLock;
use keeper::retention::DeletionOutcome;
use keeper::{ArtifactClass, BackupRequest, Config, Coordinator, CoordinatorBuilder, Error, SnapshotId};
use keeper_storage::LocalStorage;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Documents adapter whose capture blocks until the test opens the gate.
struct GatedAdapter {
    inner: DocumentsAdapter,
    started: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl SourceAdapter for GatedAdapter {
    fn class(&self) -> ArtifactClass {
        ArtifactClass::Documents
    }

    fn shape(&self) -> ArtifactShape {
        ArtifactShape::Archive
    }

    async fn capture(
        &self,
        snapshot_id: &SnapshotId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> keeper::Result<Artifact> {
        self.started.notify_one();
        self.gate.notified().await;
        self.inner.capture(snapshot_id, dest, cancel).await
    }

    async fn restore(&self, artifact: &Artifact, raw: &Path) -> keeper::Result<()> {
        self.inner.restore(artifact, raw).await
    }
}

fn setup(temp: &TempDir) -> (Config, PathBuf) {
    let docs = temp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("a.txt"), "alpha").unwrap();

    let mut config = Config::default();
    config.backup_root = temp.path().join("backups");
    config.defaults.stop_for_vector_backup = false;
    config.defaults.cleanup_old_backups = false;
    config.defaults.upload_to_remote = true;
    config.publish.initial_backoff_ms = 1;
    (config, docs)
}

fn coordinator(temp: &TempDir) -> Coordinator {
    let (config, docs) = setup(temp);
    CoordinatorBuilder::new(config)
        .adapter(Arc::new(DocumentsAdapter::new(docs)))
        .remote(Arc::new(LocalStorage::new(temp.path().join("remote"))))
        .build()
        .unwrap()
}

async fn backup(coordinator: &Coordinator) -> SnapshotId {
    let report = coordinator
        .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.succeeded(), "{:?}", report.manifest.classes);
    report.manifest.snapshot_id
}

fn count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|e| e.count()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_prune_waits_out_running_backup() {
    let temp = TempDir::new().unwrap();
    let (config, docs) = setup(&temp);
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());
    let coordinator = CoordinatorBuilder::new(config)
        .adapter(Arc::new(GatedAdapter {
            inner: DocumentsAdapter::new(docs),
            started: started.clone(),
            gate: gate.clone(),
        }))
        .remote(Arc::new(LocalStorage::new(temp.path().join("remote"))))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let run = coordinator.run_backup(BackupRequest::new("prod"), &cancel);
    let contender = async {
        started.notified().await;
        let contended = coordinator.prune("prod", &BTreeMap::new()).await;
        gate.notify_one();
        contended
    };
    let (report, contended) = tokio::join!(run, contender);

    assert!(matches!(contended, Err(Error::LockContention { .. })));
    assert!(report.unwrap().succeeded());

    // Lock released once the run finished
    coordinator.prune("prod", &BTreeMap::new()).await.unwrap();
}

#[tokio::test]
async fn test_held_lock_refuses_backup_and_prune() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(&temp);

    let held = RunLock::acquire(
        &temp.path().join("backups"),
        "prod",
        "operator",
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let err = coordinator
        .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockContention { .. }));
    let err = coordinator.prune("prod", &BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::LockContention { .. }));

    // Refused runs leave no manifest behind
    assert!(coordinator.list_snapshots("prod").await.unwrap().is_empty());

    held.release().await;
    backup(&coordinator).await;
    assert_eq!(coordinator.list_snapshots("prod").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_other_environments_are_not_blocked() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(&temp);
    let _held = RunLock::acquire(
        &temp.path().join("backups"),
        "staging",
        "operator",
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    backup(&coordinator).await;
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_prune_removes_expired_snapshots_everywhere() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(&temp);

    let first = backup(&coordinator).await;
    let second = backup(&coordinator).await;
    let newest = backup(&coordinator).await;
    assert!(first < second && second < newest);

    let local_docs = temp.path().join("backups/prod/documents");
    let remote_docs = temp.path().join("remote/prod/documents");
    assert_eq!(count(&local_docs), 3);
    assert_eq!(count(&remote_docs), 3);

    let overrides = BTreeMap::from([(ArtifactClass::Documents, 0)]);
    let report = coordinator.prune("prod", &overrides).await.unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.retained.get(&ArtifactClass::Documents), Some(&newest));
    assert_eq!(report.manifests_removed.len(), 2);
    assert!(!report.manifests_removed.contains(&newest));
    for pruned in &report.artifacts {
        assert_eq!(pruned.local, DeletionOutcome::Deleted);
        assert_eq!(pruned.remote, DeletionOutcome::Deleted);
    }

    assert_eq!(count(&local_docs), 1);
    assert_eq!(count(&remote_docs), 1);
    assert_eq!(count(&temp.path().join("remote/prod/manifests")), 1);
    let left = coordinator.list_snapshots("prod").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].snapshot_id, newest);

    // Nothing left to do on a second pass
    let again = coordinator.prune("prod", &overrides).await.unwrap();
    assert!(again.artifacts.is_empty());
    assert!(again.manifests_removed.is_empty());
}

#[tokio::test]
async fn test_default_windows_keep_recent_snapshots() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(&temp);
    backup(&coordinator).await;
    backup(&coordinator).await;

    let report = coordinator.prune("prod", &BTreeMap::new()).await.unwrap();
    assert!(report.artifacts.is_empty());
    assert_eq!(coordinator.list_snapshots("prod").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_backup_run_prunes_when_cleanup_enabled() {
    let temp = TempDir::new().unwrap();
    let (mut config, docs) = setup(&temp);
    config.defaults.cleanup_old_backups = true;
    let coordinator = CoordinatorBuilder::new(config)
        .adapter(Arc::new(DocumentsAdapter::new(docs)))
        .remote(Arc::new(LocalStorage::new(temp.path().join("remote"))))
        .build()
        .unwrap();

    backup(&coordinator).await;
    let report = coordinator
        .run_backup(
            BackupRequest::new("prod").with_retention(BTreeMap::from([(ArtifactClass::Documents, 0)])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let prune = report.prune.unwrap();
    assert_eq!(prune.manifests_removed.len(), 1);
    assert_eq!(coordinator.list_snapshots("prod").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_snapshot_protects_newest() {
    let temp = TempDir::new().unwrap();
    let coordinator = coordinator(&temp);
    let older = backup(&coordinator).await;
    let newest = backup(&coordinator).await;

    let err = coordinator.delete_snapshot(&newest).await.unwrap_err();
    assert!(matches!(err, Error::RetentionConflict(_)));

    let report = coordinator.delete_snapshot(&older).await.unwrap();
    assert_eq!(report.manifests_removed, vec![older.clone()]);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].local, DeletionOutcome::Deleted);

    let err = coordinator.delete_snapshot(&older).await.unwrap_err();
    assert!(matches!(err, Error::SnapshotNotFound(_)));
    assert_eq!(coordinator.list_snapshots("prod").await.unwrap().len(), 1);
}
