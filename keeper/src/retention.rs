//! Retention: deciding which snapshots have aged out, and deleting them.
//!
//! Planning is pure (`plan`) and works only on persisted manifests. Execution
//! deletes local files and remote objects independently and reports each
//! outcome per artifact. The newest `complete` snapshot of every class is
//! never deleted, whatever its age.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keeper_storage::ObjectStorage;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{Artifact, ArtifactClass};
use crate::error::{Error, Result};
use crate::lock::RunLock;
use crate::manifest::{ManifestStatus, ManifestStore, SnapshotId, SnapshotManifest};
use crate::metrics;
use crate::publish::RemotePublisher;

/// Retention window in days per class. A class without a window is kept forever.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    days: BTreeMap<ArtifactClass, u32>,
}

impl RetentionPolicy {
    pub fn new(days: BTreeMap<ArtifactClass, u32>) -> Self {
        Self { days }
    }

    pub fn days(&self, class: ArtifactClass) -> Option<u32> {
        self.days.get(&class).copied()
    }

    /// Replace the window of every class present in `overrides`.
    pub fn with_overrides(mut self, overrides: &BTreeMap<ArtifactClass, u32>) -> Self {
        for (class, days) in overrides {
            self.days.insert(*class, *days);
        }
        self
    }

    fn expired(&self, class: ArtifactClass, taken_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.days(class) {
            Some(days) => now - taken_at > ChronoDuration::days(i64::from(days)),
            None => false,
        }
    }
}

/// One artifact scheduled for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDeletion {
    pub snapshot_id: SnapshotId,
    pub class: ArtifactClass,
    pub artifact: Artifact,
    /// Newer complete snapshot that still covers the class
    pub covered_by: SnapshotId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunePlan {
    pub deletions: Vec<PlannedDeletion>,
    /// Manifests left with no artifact once the deletions succeed
    pub manifest_removals: Vec<SnapshotId>,
    /// Newest complete snapshot per class, kept regardless of age
    pub retained: BTreeMap<ArtifactClass, SnapshotId>,
}

/// Decide what to prune. Only final manifests are considered; in-progress
/// ones belong to a run that is active or crashed and are left alone.
pub fn plan(manifests: &[SnapshotManifest], policy: &RetentionPolicy, now: DateTime<Utc>) -> PrunePlan {
    let mut sorted: Vec<&SnapshotManifest> = manifests.iter().filter(|m| m.is_final()).collect();
    sorted.sort_by(|a, b| {
        (b.snapshot_id.timestamp(), b.snapshot_id.sequence())
            .cmp(&(a.snapshot_id.timestamp(), a.snapshot_id.sequence()))
    });

    let mut result = PrunePlan::default();
    let mut doomed: BTreeMap<SnapshotId, BTreeSet<ArtifactClass>> = BTreeMap::new();

    for class in ArtifactClass::ALL {
        // Newest complete manifest seen so far while walking newest to oldest
        let mut covering: Option<&SnapshotId> = None;

        for manifest in &sorted {
            let Some(entry) = manifest.classes.get(&class) else {
                continue;
            };

            if manifest.status == ManifestStatus::Complete && entry.succeeded() && covering.is_none() {
                covering = Some(&manifest.snapshot_id);
                result.retained.insert(class, manifest.snapshot_id.clone());
                continue;
            }

            let (Some(artifact), Some(cover)) = (&entry.artifact, covering) else {
                continue;
            };
            if !policy.expired(class, manifest.snapshot_id.timestamp(), now) {
                continue;
            }

            result.deletions.push(PlannedDeletion {
                snapshot_id: manifest.snapshot_id.clone(),
                class,
                artifact: artifact.clone(),
                covered_by: cover.clone(),
            });
            doomed
                .entry(manifest.snapshot_id.clone())
                .or_default()
                .insert(class);
        }
    }

    for manifest in &sorted {
        let gone = doomed.get(&manifest.snapshot_id);
        let holds_artifact = manifest.classes.iter().any(|(class, entry)| {
            entry.artifact.is_some() && !gone.is_some_and(|g| g.contains(class))
        });
        if holds_artifact {
            continue;
        }
        // Artifact-less manifests (failed runs) age out with their longest window
        let aged_out = manifest
            .classes
            .keys()
            .all(|class| policy.expired(*class, manifest.snapshot_id.timestamp(), now));
        if gone.is_some() || aged_out {
            result.manifest_removals.push(manifest.snapshot_id.clone());
        }
    }

    result
}

/// Outcome of deleting one copy of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DeletionOutcome {
    Deleted,
    /// Already absent
    NotPresent,
    /// The copy never existed (e.g. never published)
    NotApplicable,
    /// Not attempted
    Skipped(String),
    Failed(String),
}

impl DeletionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DeletionOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrunedArtifact {
    pub snapshot_id: SnapshotId,
    pub class: ArtifactClass,
    pub local: DeletionOutcome,
    pub remote: DeletionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub environment: String,
    pub artifacts: Vec<PrunedArtifact>,
    pub manifests_removed: Vec<SnapshotId>,
    pub retained: BTreeMap<ArtifactClass, SnapshotId>,
    /// Manifest removals that failed, with the reason
    pub manifest_errors: BTreeMap<String, String>,
}

impl PruneReport {
    pub fn has_failures(&self) -> bool {
        !self.manifest_errors.is_empty()
            || self
                .artifacts
                .iter()
                .any(|a| a.local.is_failure() || a.remote.is_failure())
    }
}

/// Applies retention to one backup root and its optional remote mirror.
#[derive(Clone)]
pub struct RetentionManager {
    manifests: ManifestStore,
    remote: Option<Arc<dyn ObjectStorage>>,
    lock_lease: Duration,
}

impl RetentionManager {
    pub fn new(manifests: ManifestStore, remote: Option<Arc<dyn ObjectStorage>>, lock_lease: Duration) -> Self {
        Self {
            manifests,
            remote,
            lock_lease,
        }
    }

    /// Prune `environment` under its run lock.
    ///
    /// # Errors
    ///
    /// `LockContention` when a backup or another prune holds the lock.
    #[instrument(skip(self, policy))]
    pub async fn prune(&self, environment: &str, policy: &RetentionPolicy) -> Result<PruneReport> {
        let lock =
            RunLock::acquire(self.manifests.backup_root(), environment, "prune", self.lock_lease)
                .await?;
        let report = self.prune_locked(environment, policy, &lock).await;
        lock.release().await;
        report
    }

    /// Prune while the caller already holds the environment's run lock.
    pub async fn prune_locked(
        &self,
        environment: &str,
        policy: &RetentionPolicy,
        _lock: &RunLock,
    ) -> Result<PruneReport> {
        let manifests = self.manifests.list(environment).await?;
        let plan = plan(&manifests, policy, Utc::now());
        debug!(
            deletions = plan.deletions.len(),
            manifests = plan.manifest_removals.len(),
            "Retention plan"
        );
        Ok(self.execute(environment, plan).await)
    }

    async fn execute(&self, environment: &str, plan: PrunePlan) -> PruneReport {
        let mut report = PruneReport {
            environment: environment.to_string(),
            retained: plan.retained,
            ..Default::default()
        };
        let mut blocked: BTreeSet<SnapshotId> = BTreeSet::new();

        for deletion in &plan.deletions {
            let pruned = self.delete_artifact(&deletion.artifact).await;
            if pruned.local.is_failure() || pruned.remote.is_failure() {
                blocked.insert(deletion.snapshot_id.clone());
            }
            report.artifacts.push(pruned);
        }

        for id in plan.manifest_removals {
            if blocked.contains(&id) {
                continue;
            }
            match self.manifests.remove(&id).await {
                Ok(()) => report.manifests_removed.push(id),
                Err(e) => {
                    warn!(snapshot_id = %id, error = %e, "Failed to remove manifest");
                    report.manifest_errors.insert(id.to_string(), e.to_string());
                }
            }
        }

        info!(
            environment,
            artifacts = report.artifacts.len(),
            manifests = report.manifests_removed.len(),
            failures = report.has_failures(),
            "Retention applied"
        );
        report
    }

    /// Delete both copies of one artifact. Local and remote are independent.
    async fn delete_artifact(&self, artifact: &Artifact) -> PrunedArtifact {
        let environment = artifact.snapshot_id.environment();
        let local = delete_local(&artifact.local_path).await;
        if local == DeletionOutcome::Deleted {
            metrics::record_pruned(environment, artifact.class, "local");
        }

        let remote = match (&artifact.remote_location, &self.remote) {
            (None, _) => DeletionOutcome::NotApplicable,
            (Some(_), None) => DeletionOutcome::Skipped("remote storage not configured".into()),
            (Some(_), Some(storage)) => {
                let key = RemotePublisher::key_for(artifact);
                match storage.exists(&key).await {
                    Ok(false) => DeletionOutcome::NotPresent,
                    Ok(true) => match storage.delete(&key).await {
                        Ok(()) => {
                            metrics::record_pruned(environment, artifact.class, "remote");
                            DeletionOutcome::Deleted
                        }
                        Err(e) => DeletionOutcome::Failed(e.to_string()),
                    },
                    Err(e) => DeletionOutcome::Failed(e.to_string()),
                }
            }
        };

        if local.is_failure() || remote.is_failure() {
            warn!(
                class = %artifact.class,
                snapshot_id = %artifact.snapshot_id,
                ?local,
                ?remote,
                "Artifact deletion incomplete"
            );
        }
        PrunedArtifact {
            snapshot_id: artifact.snapshot_id.clone(),
            class: artifact.class,
            local,
            remote,
        }
    }

    /// Delete one snapshot outright.
    ///
    /// # Errors
    ///
    /// `RetentionConflict` when the snapshot is the newest complete one for
    /// any of its classes.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn delete_snapshot(&self, id: &SnapshotId) -> Result<PruneReport> {
        let environment = id.environment();
        let lock =
            RunLock::acquire(self.manifests.backup_root(), environment, "delete", self.lock_lease)
                .await?;

        let target = self.manifests.load(id).await?;
        let all = self.manifests.list(environment).await?;
        let floor = plan(&all, &RetentionPolicy::default(), Utc::now()).retained;
        let protected: Vec<ArtifactClass> = floor
            .iter()
            .filter(|(_, newest)| *newest == id)
            .map(|(class, _)| *class)
            .collect();
        if !protected.is_empty() {
            return Err(Error::RetentionConflict(format!(
                "{} is the newest complete snapshot for {}",
                id,
                protected
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut report = PruneReport {
            environment: environment.to_string(),
            retained: floor,
            ..Default::default()
        };
        for entry in target.classes.values() {
            if let Some(artifact) = &entry.artifact {
                report.artifacts.push(self.delete_artifact(artifact).await);
            }
        }
        if !report.has_failures() {
            self.manifests.remove(id).await?;
            report.manifests_removed.push(id.clone());
        }

        lock.release().await;
        Ok(report)
    }
}

async fn delete_local(path: &Path) -> DeletionOutcome {
    match tokio::fs::remove_file(path).await {
        Ok(()) => DeletionOutcome::Deleted,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeletionOutcome::NotPresent,
        Err(e) => DeletionOutcome::Failed(e.to_string()),
    }
}
