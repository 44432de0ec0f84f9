//! Snapshot coordinator.
//!
//! One coordinator run takes an environment from "lock acquired" to "manifest
//! finalized": drain the application if asked to, capture every requested
//! class (one task per class), verify, seal, re-verify and publish each
//! artifact, then persist the manifest and apply retention under the same
//! run lock. Per-class failures are recorded in the manifest and never stop
//! the other classes; only run-level problems (lock contention, quiesce
//! abort, configuration) end a run early.
//!
//! Restore reads the persisted manifest only, fetches containers from remote
//! storage when the local copy is gone or damaged, unseals them into a
//! staging directory and hands the raw capture to the class's adapter.

use chrono::Utc;
use keeper_storage::{ObjectKey, ObjectStorage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterSet, SourceAdapter};
use crate::artifact::{sha256_file, Artifact, ArtifactClass};
use crate::config::{ClassPolicy, Config, StageTimeouts};
use crate::error::{Error, Result};
use crate::lock::RunLock;
use crate::manifest::{
    validate_environment, ClassFailure, ManifestStatus, ManifestStore, QuiesceWindow, SnapshotId,
    SnapshotManifest, Stage,
};
use crate::metrics::{self, StageTimer};
use crate::publish::RemotePublisher;
use crate::quiesce::{Application, HttpApplication, QuiesceController, QuiesceGuard};
use crate::retention::{PruneReport, RetentionManager};
use crate::retry::RetryPolicy;
use crate::run_blocking;
use crate::seal::{unseal, EncryptionKey, Sealer};
use crate::verify::{mark_verified, Verifier, VerifyPolicy};

/// How long cancelled captures get to stop before they are aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Parameters of one backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub environment: String,
    /// Classes to capture; empty means every configured source
    pub classes: Vec<ArtifactClass>,
    /// Drain the application first. `None` follows the environment policy.
    pub quiesce: Option<bool>,
    /// Retention days overriding the policy for the post-backup prune
    pub retention_overrides: BTreeMap<ArtifactClass, u32>,
}

impl BackupRequest {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn with_classes(mut self, classes: Vec<ArtifactClass>) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_quiesce(mut self, quiesce: bool) -> Self {
        self.quiesce = Some(quiesce);
        self
    }

    pub fn with_retention(mut self, overrides: BTreeMap<ArtifactClass, u32>) -> Self {
        self.retention_overrides = overrides;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub manifest: SnapshotManifest,
    /// Remote location of the mirrored manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<PruneReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_error: Option<String>,
    pub cancelled: bool,
}

impl BackupReport {
    pub fn status(&self) -> ManifestStatus {
        self.manifest.status
    }

    /// Every requested class succeeded.
    pub fn succeeded(&self) -> bool {
        self.manifest.status == ManifestStatus::Complete && !self.cancelled
    }
}

/// Parameters of one restore run.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub environment: String,
    pub snapshot_id: SnapshotId,
    /// Classes to restore; empty means every class of the snapshot
    pub classes: Vec<ArtifactClass>,
    /// Restore what is restorable from a snapshot that is not complete
    pub allow_partial: bool,
    /// Drain the application while restoring. `None` follows the policy.
    pub quiesce: Option<bool>,
}

impl RestoreRequest {
    pub fn new(snapshot_id: SnapshotId) -> Self {
        Self {
            environment: snapshot_id.environment().to_string(),
            snapshot_id,
            classes: Vec::new(),
            allow_partial: false,
            quiesce: None,
        }
    }
}

/// Where a restored container was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClassRestore {
    Restored { source: ContainerSource },
    Skipped { reason: String },
    Failed { failure: ClassFailure },
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub environment: String,
    pub snapshot_id: SnapshotId,
    pub manifest_status: ManifestStatus,
    pub classes: BTreeMap<ArtifactClass, ClassRestore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_resumed: Option<bool>,
    pub cancelled: bool,
}

impl RestoreReport {
    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self
                .classes
                .values()
                .all(|c| !matches!(c, ClassRestore::Failed { .. }))
    }
}

/// Integrity of one copy of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Ok,
    Missing,
    Corrupt(String),
    NotApplicable,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityCheck {
    pub local: CheckOutcome,
    pub remote: CheckOutcome,
}

impl IntegrityCheck {
    /// At least one good copy and no damaged one.
    pub fn is_healthy(&self) -> bool {
        let damaged = |o: &CheckOutcome| matches!(o, CheckOutcome::Corrupt(_) | CheckOutcome::Error(_));
        (self.local == CheckOutcome::Ok || self.remote == CheckOutcome::Ok)
            && !damaged(&self.local)
            && !damaged(&self.remote)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub snapshot_id: SnapshotId,
    pub status: ManifestStatus,
    pub classes: BTreeMap<ArtifactClass, IntegrityCheck>,
}

impl VerifyReport {
    pub fn healthy(&self) -> bool {
        self.classes.values().all(IntegrityCheck::is_healthy)
    }
}

/// Stage-by-stage processing of captured artifacts. Shared by the per-class tasks.
struct Pipeline {
    verifier: Verifier,
    sealer: Sealer,
    publisher: Option<RemotePublisher>,
    timeouts: StageTimeouts,
    capture_retry: RetryPolicy,
}

/// A class that failed after capture, with the artifact if it is still usable.
struct StageFailure {
    stage: Stage,
    error: Error,
    artifact: Option<Artifact>,
}

impl StageFailure {
    fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            error,
            artifact: None,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<Config>,
    adapters: AdapterSet,
    manifests: ManifestStore,
    remote: Option<Arc<dyn ObjectStorage>>,
    quiesce: Option<QuiesceController>,
    pipeline: Arc<Pipeline>,
    retention: RetentionManager,
}

/// Assembles a coordinator from a config plus explicit collaborators.
pub struct CoordinatorBuilder {
    config: Config,
    adapters: AdapterSet,
    application: Option<Arc<dyn Application>>,
    remote: Option<Arc<dyn ObjectStorage>>,
    key: Option<EncryptionKey>,
}

impl CoordinatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            adapters: AdapterSet::new(),
            application: None,
            remote: None,
            key: None,
        }
    }

    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter);
        self
    }

    pub fn application(mut self, app: Arc<dyn Application>) -> Self {
        self.application = Some(app);
        self
    }

    pub fn remote(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.remote = Some(storage);
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let config = self.config;
        config.validate()?;
        let timeouts = config.stage_timeouts();

        let capture_backoff = Duration::from_millis(config.sources.capture_backoff_ms);
        let capture_retry = RetryPolicy {
            max_attempts: config.sources.capture_attempts,
            initial_backoff: capture_backoff,
            max_backoff: capture_backoff * 16,
            attempt_timeout: timeouts.capture,
        };
        let publish_retry = RetryPolicy {
            max_attempts: config.publish.max_attempts,
            initial_backoff: Duration::from_millis(config.publish.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.publish.max_backoff_ms),
            attempt_timeout: timeouts.publish,
        };

        let manifests = ManifestStore::new(config.backup_root.clone(), self.remote.clone());
        let retention = RetentionManager::new(manifests.clone(), self.remote.clone(), timeouts.lock_lease);
        let quiesce = self
            .application
            .map(|app| QuiesceController::from_config(app, &config.application));
        let publisher = self
            .remote
            .clone()
            .map(|storage| RemotePublisher::new(storage, publish_retry));

        Ok(Coordinator {
            pipeline: Arc::new(Pipeline {
                verifier: Verifier::new(self.key.clone()),
                sealer: Sealer::new(config.compression.level, self.key),
                publisher,
                timeouts,
                capture_retry,
            }),
            config: Arc::new(config),
            adapters: self.adapters,
            manifests,
            remote: self.remote,
            quiesce,
            retention,
        })
    }
}

impl Coordinator {
    /// Wire sources, application endpoint, remote storage and encryption key
    /// from the configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let mut builder = CoordinatorBuilder::new(config.clone())
            .adapters(AdapterSet::from_config(&config.sources));

        if config.application.base_url.is_some() {
            builder = builder.application(Arc::new(HttpApplication::from_config(&config.application)?));
        }
        if let Some(remote) = config.remote.create_storage()? {
            builder = builder.remote(remote);
        }
        if std::env::var_os(&config.encryption.key_env).is_some() {
            let mut key = EncryptionKey::from_env(&config.encryption.key_env)?;
            if let Some(id) = &config.encryption.key_id {
                key = key.with_key_id(id.clone());
            }
            builder = builder.encryption_key(key);
        }
        builder.build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Capture, verify, seal and publish the requested classes.
    ///
    /// Returns a report for every run that got as far as allocating a
    /// snapshot id, including failed and cancelled runs.
    ///
    /// # Errors
    ///
    /// `Config` for an unusable request, `LockContention` when another run
    /// holds the environment, or a storage error persisting the manifest.
    #[instrument(skip(self, request, cancel), fields(environment = %request.environment))]
    pub async fn run_backup(&self, request: BackupRequest, cancel: &CancellationToken) -> Result<BackupReport> {
        let environment = request.environment.as_str();
        let policy = self.config.policy_for(environment)?;
        if !policy.enabled {
            return Err(Error::Config(format!(
                "Backups are disabled for environment {}",
                environment
            )));
        }
        let classes = self.resolve_classes(&request.classes)?;
        let quiesce = request
            .quiesce
            .unwrap_or(policy.quiesce && classes.contains(&ArtifactClass::VectorIndex));
        let controller = if quiesce {
            Some(self.quiesce.as_ref().ok_or_else(|| {
                Error::Config("Quiesce requested but no [application] endpoint is configured".into())
            })?)
        } else {
            None
        };
        if policy.upload && self.pipeline.publisher.is_none() {
            return Err(Error::Config(format!(
                "Upload is enabled for {} but no [remote] storage is configured",
                environment
            )));
        }
        if policy.encrypt && self.pipeline.sealer.key().is_none() {
            return Err(Error::Config(format!(
                "Encryption is enabled for {} but {} is not set",
                environment, self.config.encryption.key_env
            )));
        }
        let verify_policies = self.config.verify_policies(&policy);

        let lock = RunLock::acquire(
            self.manifests.backup_root(),
            environment,
            "backup",
            self.pipeline.timeouts.lock_lease,
        )
        .await?;

        let started = Utc::now();
        let sequence = self.manifests.next_sequence(environment, started).await?;
        let snapshot_id = SnapshotId::new(environment, started, sequence)?;
        let mut manifest = SnapshotManifest::new(snapshot_id.clone(), &classes, quiesce);
        self.manifests.save(&manifest).await?;
        info!(%snapshot_id, ?classes, quiesce, "Backup started");

        let captured = match controller {
            Some(controller) => match controller.quiesce(cancel).await {
                Ok(guard) => self.capture_quiesced(&mut manifest, &classes, guard, cancel).await,
                Err(aborted) => {
                    error!(error = %aborted.cause, resumed = aborted.resumed, "Quiesce aborted the run");
                    manifest.application_resumed = Some(aborted.resumed);
                    manifest.abort_reason = Some(aborted.cause.to_string());
                    manifest.fail_pending(&ClassFailure::from_error(Stage::Quiesce, &aborted.cause));
                    BTreeMap::new()
                }
            },
            None => {
                let results = self.capture_classes(&snapshot_id, &classes, cancel).await;
                record_captures(&mut manifest, results)
            }
        };

        let mut set = JoinSet::new();
        for (class, raw) in captured {
            let pipeline = Arc::clone(&self.pipeline);
            let class_policy = policy.class(class);
            let verify_policy = verify_policies.get(&class).cloned().unwrap_or_default();
            let encrypt = policy.encrypt;
            let upload = policy.upload;
            let cancel = cancel.clone();
            set.spawn(async move {
                let outcome = pipeline
                    .process(raw, class_policy, verify_policy, encrypt, upload, &cancel)
                    .await;
                (class, outcome)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(artifact))) => {
                    if let Err(e) = manifest.record_success(artifact) {
                        error!(error = %e, "Could not record artifact");
                    }
                }
                Ok((class, Err(failure))) => {
                    record_failure(&mut manifest, class, failure.stage, &failure.error, failure.artifact);
                }
                Err(e) => error!(error = %e, "Artifact task failed"),
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            manifest
                .abort_reason
                .get_or_insert_with(|| Error::Cancelled.to_string());
            manifest.fail_pending(&ClassFailure::from_error(Stage::Capture, &Error::Cancelled));
        }

        let status = manifest.finalize();
        for (class, entry) in &manifest.classes {
            if let Some(failure) = &entry.failure {
                warn!(%class, stage = %failure.stage, kind = %failure.kind, message = %failure.message, "Class failed");
                metrics::record_class_failure(environment, *class, failure.stage, failure.kind);
            }
        }
        metrics::record_backup_run(environment, status);

        self.manifests.save(&manifest).await?;
        let (manifest_location, mirror_error) = match self.manifests.mirror(&manifest).await {
            Ok(location) => (location, None),
            Err(e) => {
                warn!(error = %e, "Manifest mirror failed; local manifest is authoritative");
                (None, Some(e.to_string()))
            }
        };

        let (prune, prune_error) = if policy.cleanup && !cancelled {
            let retention = policy.retention().with_overrides(&request.retention_overrides);
            match self.retention.prune_locked(environment, &retention, &lock).await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    warn!(error = %e, "Post-backup prune failed");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };
        lock.release().await;

        info!(
            %snapshot_id,
            %status,
            succeeded = manifest.succeeded_classes().len(),
            failed = manifest.failed_classes().len(),
            published = manifest.published_count(),
            "Backup finished"
        );

        Ok(BackupReport {
            manifest,
            manifest_location,
            mirror_error,
            prune,
            prune_error,
            cancelled,
        })
    }

    fn resolve_classes(&self, requested: &[ArtifactClass]) -> Result<Vec<ArtifactClass>> {
        let mut classes: Vec<ArtifactClass> = if requested.is_empty() {
            self.adapters.classes()
        } else {
            requested.to_vec()
        };
        classes.sort();
        classes.dedup();
        if classes.is_empty() {
            return Err(Error::Config("No artifact sources are configured".into()));
        }
        for class in &classes {
            self.adapters.get(*class)?;
        }
        Ok(classes)
    }

    /// Local path of a fresh capture; mirrors the remote key layout.
    fn raw_path(&self, snapshot_id: &SnapshotId, class: ArtifactClass) -> PathBuf {
        ObjectKey::artifact(
            snapshot_id.environment(),
            class.object_kind(),
            snapshot_id.as_str(),
            class.raw_extension(),
        )
        .to_path_buf(self.manifests.backup_root())
    }

    /// Capture `classes` concurrently, one task per class.
    async fn capture_classes(
        &self,
        snapshot_id: &SnapshotId,
        classes: &[ArtifactClass],
        cancel: &CancellationToken,
    ) -> BTreeMap<ArtifactClass, Result<Artifact>> {
        let mut results = BTreeMap::new();
        let mut set = JoinSet::new();

        for class in classes.iter().copied() {
            let adapter = match self.adapters.get(class) {
                Ok(adapter) => adapter,
                Err(e) => {
                    results.insert(class, Err(e));
                    continue;
                }
            };
            let dest = self.raw_path(snapshot_id, class);
            let id = snapshot_id.clone();
            let retry = self.pipeline.capture_retry;
            let cancel = cancel.clone();
            set.spawn(async move { (class, capture_one(adapter, id, dest, retry, cancel).await) });
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("Capture cancelled, waiting for captures to stop");
                    cancelled = true;
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(joined) => collect_capture(&mut results, joined),
                    None => break,
                },
            }
        }

        // Adapters see the token themselves; their blocking work has to wind
        // down before partial files can be removed.
        if cancelled {
            let drain = async {
                while let Some(joined) = set.join_next().await {
                    collect_capture(&mut results, joined);
                }
            };
            if tokio::time::timeout(CANCEL_GRACE, drain).await.is_err() {
                error!(grace = ?CANCEL_GRACE, "Captures ignored cancellation, aborting them");
                set.abort_all();
                while set.join_next().await.is_some() {}
            }
        }

        for class in classes {
            if !matches!(results.get(class), Some(Ok(_))) {
                let _ = tokio::fs::remove_file(self.raw_path(snapshot_id, *class)).await;
            }
        }
        results
    }

    /// Capture inside a quiesce window: the vector index goes last, once the
    /// other captures are confirmed to have happened while drained.
    async fn capture_quiesced(
        &self,
        manifest: &mut SnapshotManifest,
        classes: &[ArtifactClass],
        guard: QuiesceGuard,
        cancel: &CancellationToken,
    ) -> BTreeMap<ArtifactClass, Artifact> {
        let snapshot_id = manifest.snapshot_id.clone();
        let opened_at = guard.opened_at();
        manifest.quiesce_window = Some(QuiesceWindow {
            opened_at,
            closed_at: None,
        });

        let (vector, others): (Vec<ArtifactClass>, Vec<ArtifactClass>) = classes
            .iter()
            .partition(|c| **c == ArtifactClass::VectorIndex);

        let results = self.capture_classes(&snapshot_id, &others, cancel).await;
        let mut captured = record_captures(manifest, results);

        if !vector.is_empty() && !cancel.is_cancelled() {
            match confirm_window(&guard, &captured).await {
                Ok(()) => {
                    let results = self.capture_classes(&snapshot_id, &vector, cancel).await;
                    captured.extend(record_captures(manifest, results));
                }
                Err(e) => {
                    warn!(error = %e, "Snapshot is not consistent, discarding window captures");
                    for (class, artifact) in std::mem::take(&mut captured) {
                        let _ = tokio::fs::remove_file(&artifact.local_path).await;
                        record_failure(manifest, class, Stage::Capture, &e, None);
                    }
                    record_failure(manifest, ArtifactClass::VectorIndex, Stage::Capture, &e, None);
                }
            }
        }

        if let Some(window) = manifest.quiesce_window.as_mut() {
            window.closed_at = Some(Utc::now());
        }
        let resumed = guard.release().await;
        if !resumed {
            error!(%snapshot_id, "Application was not confirmed resumed");
        }
        manifest.application_resumed = Some(resumed);
        captured
    }

    /// Restore classes of a persisted snapshot.
    ///
    /// # Errors
    ///
    /// `ManifestNotComplete` when the snapshot is not complete for the
    /// requested classes and partial restore was not allowed. Per-class
    /// restore failures are reported, not returned.
    #[instrument(skip(self, request, cancel), fields(environment = %request.environment, snapshot_id = %request.snapshot_id))]
    pub async fn run_restore(&self, request: RestoreRequest, cancel: &CancellationToken) -> Result<RestoreReport> {
        let id = &request.snapshot_id;
        let environment = request.environment.as_str();
        if id.environment() != environment {
            return Err(Error::Config(format!(
                "Snapshot {} does not belong to environment {}",
                id, environment
            )));
        }
        let policy = self.config.policy_for(environment)?;
        let manifest = self.manifests.load(id).await?;

        let mut classes: Vec<ArtifactClass> = if request.classes.is_empty() {
            manifest.classes.keys().copied().collect()
        } else {
            request.classes.clone()
        };
        classes.sort();
        classes.dedup();

        let unrestorable = manifest.unrestorable(&classes);
        if !manifest.is_restorable_for(&classes) {
            if !request.allow_partial {
                let listed = if unrestorable.is_empty() { &classes } else { &unrestorable };
                return Err(Error::ManifestNotComplete {
                    snapshot_id: id.to_string(),
                    status: manifest.status,
                    classes: listed.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
                });
            }
            warn!(status = %manifest.status, ?unrestorable, "Partial restore requested");
        }
        for class in &classes {
            if !unrestorable.contains(class) {
                self.adapters.get(*class)?;
            }
        }

        let quiesce = request
            .quiesce
            .unwrap_or(policy.quiesce && self.quiesce.is_some());
        let controller = if quiesce {
            Some(self.quiesce.as_ref().ok_or_else(|| {
                Error::Config("Quiesce requested but no [application] endpoint is configured".into())
            })?)
        } else {
            None
        };

        let lock = RunLock::acquire(
            self.manifests.backup_root(),
            environment,
            "restore",
            self.pipeline.timeouts.lock_lease,
        )
        .await?;
        let guard = match controller {
            Some(controller) => Some(controller.quiesce(cancel).await.map_err(|aborted| aborted.cause)?),
            None => None,
        };

        let mut outcomes = BTreeMap::new();
        for class in &classes {
            let artifact = match manifest.artifact(*class) {
                Some(artifact) => artifact,
                None => {
                    let reason = match manifest.classes.get(class) {
                        Some(entry) => match &entry.failure {
                            Some(f) => format!("class failed during backup at {}: {}", f.stage, f.message),
                            None => "class has no verified artifact".to_string(),
                        },
                        None => "class is not part of the snapshot".to_string(),
                    };
                    outcomes.insert(*class, ClassRestore::Skipped { reason });
                    continue;
                }
            };
            if cancel.is_cancelled() {
                outcomes.insert(
                    *class,
                    ClassRestore::Failed {
                        failure: ClassFailure::from_error(Stage::Restore, &Error::Cancelled),
                    },
                );
                continue;
            }

            let staging = self
                .manifests
                .backup_root()
                .join(environment)
                .join(format!(".restore-{}", uuid::Uuid::new_v4().simple()));
            let timer = StageTimer::new(*class, Stage::Restore);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = self.restore_class(artifact, &staging) => r,
            };
            timer.finish(&result);
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %e, "Could not clean restore staging");
                }
            }

            let outcome = match result {
                Ok(source) => {
                    info!(%class, ?source, "Class restored");
                    ClassRestore::Restored { source }
                }
                Err(e) => {
                    error!(%class, error = %e, "Class restore failed");
                    ClassRestore::Failed {
                        failure: ClassFailure::from_error(Stage::Restore, &e),
                    }
                }
            };
            outcomes.insert(*class, outcome);
        }

        let application_resumed = match guard {
            Some(guard) => Some(guard.release().await),
            None => None,
        };
        lock.release().await;

        Ok(RestoreReport {
            environment: environment.to_string(),
            snapshot_id: id.clone(),
            manifest_status: manifest.status,
            classes: outcomes,
            application_resumed,
            cancelled: cancel.is_cancelled(),
        })
    }

    async fn restore_class(&self, artifact: &Artifact, staging: &Path) -> Result<ContainerSource> {
        let adapter = self.adapters.get(artifact.class)?;
        tokio::fs::create_dir_all(staging).await?;
        let (container, source) = self.locate_container(artifact, staging).await?;

        let raw = if artifact.is_sealed() {
            let raw = staging.join(format!(
                "{}.{}",
                artifact.snapshot_id,
                artifact.class.raw_extension()
            ));
            let mut located = artifact.clone();
            located.local_path = container;
            let key = self.pipeline.sealer.key().cloned();
            let dest = raw.clone();
            run_blocking(move || unseal(&located, &dest, key.as_ref())).await?;
            raw
        } else {
            container
        };

        bounded(
            Stage::Restore,
            self.pipeline.timeouts.restore,
            adapter.restore(artifact, &raw),
        )
        .await?;
        Ok(source)
    }

    /// The local container when intact, otherwise a fresh download.
    async fn locate_container(&self, artifact: &Artifact, staging: &Path) -> Result<(PathBuf, ContainerSource)> {
        if checksum_matches(&artifact.local_path, &artifact.checksum).await? {
            return Ok((artifact.local_path.clone(), ContainerSource::Local));
        }

        let publisher = self.pipeline.publisher.as_ref().ok_or_else(|| {
            Error::RestoreFailed(format!(
                "{} container {} is missing or damaged and no remote storage is configured",
                artifact.class,
                artifact.local_path.display()
            ))
        })?;
        warn!(class = %artifact.class, path = %artifact.local_path.display(), "Local container unusable, fetching from remote");

        let dest = staging.join(format!("{}.{}", artifact.snapshot_id, artifact.extension()));
        publisher.fetch(artifact, &dest).await?;
        if !checksum_matches(&dest, &artifact.checksum).await? {
            return Err(Error::VerificationFailed(format!(
                "{} remote copy of {} does not match the recorded checksum",
                artifact.class, artifact.snapshot_id
            )));
        }
        Ok((dest, ContainerSource::Remote))
    }

    /// Re-check both copies of every artifact of a persisted snapshot.
    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub async fn verify_snapshot(&self, id: &SnapshotId) -> Result<VerifyReport> {
        let manifest = self.manifests.load(id).await?;
        let policy = self.config.policy_for(id.environment())?;
        let verify_policies = self.config.verify_policies(&policy);

        let mut classes = BTreeMap::new();
        for (class, entry) in &manifest.classes {
            let Some(artifact) = entry.artifact.as_ref() else {
                continue;
            };

            let local = if !artifact.local_path.exists() {
                CheckOutcome::Missing
            } else {
                let verifier = self.pipeline.verifier.clone();
                let vp = verify_policies.get(class).cloned().unwrap_or_default();
                let a = artifact.clone();
                match run_blocking(move || verifier.verify(&a, &vp)).await {
                    Ok(()) => CheckOutcome::Ok,
                    Err(Error::VerificationFailed(msg)) => CheckOutcome::Corrupt(msg),
                    Err(e) => CheckOutcome::Error(e.to_string()),
                }
            };

            let remote = match (&artifact.remote_location, &self.remote) {
                (None, _) => CheckOutcome::NotApplicable,
                (Some(_), None) => CheckOutcome::Error("remote storage not configured".into()),
                (Some(_), Some(storage)) => match storage.head(&RemotePublisher::key_for(artifact)).await {
                    Ok(meta) if meta.size == artifact.size_bytes => CheckOutcome::Ok,
                    Ok(meta) => CheckOutcome::Corrupt(format!(
                        "remote object has {} bytes, expected {}",
                        meta.size, artifact.size_bytes
                    )),
                    Err(e) if e.is_not_found() => CheckOutcome::Missing,
                    Err(e) => CheckOutcome::Error(e.to_string()),
                },
            };

            debug!(%class, ?local, ?remote, "Artifact checked");
            classes.insert(*class, IntegrityCheck { local, remote });
        }

        Ok(VerifyReport {
            snapshot_id: id.clone(),
            status: manifest.status,
            classes,
        })
    }

    /// Manifests of an environment, newest first.
    pub async fn list_snapshots(&self, environment: &str) -> Result<Vec<SnapshotManifest>> {
        validate_environment(environment)?;
        self.manifests.list(environment).await
    }

    /// Apply the environment's retention policy, with optional per-class overrides.
    pub async fn prune(
        &self,
        environment: &str,
        overrides: &BTreeMap<ArtifactClass, u32>,
    ) -> Result<PruneReport> {
        let policy = self.config.policy_for(environment)?;
        self.retention
            .prune(environment, &policy.retention().with_overrides(overrides))
            .await
    }

    pub async fn delete_snapshot(&self, id: &SnapshotId) -> Result<PruneReport> {
        self.retention.delete_snapshot(id).await
    }
}

impl Pipeline {
    /// Verify, seal, re-verify and publish one captured artifact.
    async fn process(
        &self,
        raw: Artifact,
        class_policy: ClassPolicy,
        verify_policy: VerifyPolicy,
        encrypt: bool,
        upload: bool,
        cancel: &CancellationToken,
    ) -> std::result::Result<Artifact, StageFailure> {
        let class = raw.class;
        let raw_path = raw.local_path.clone();

        if cancel.is_cancelled() {
            discard(&raw_path).await;
            return Err(StageFailure::new(Stage::Verify, Error::Cancelled));
        }
        let verified = match self.verify(raw, verify_policy.clone()).await {
            Ok(a) => a,
            Err(e) => {
                discard(&raw_path).await;
                return Err(StageFailure::new(Stage::Verify, e));
            }
        };

        if cancel.is_cancelled() {
            discard(&raw_path).await;
            return Err(StageFailure::new(Stage::Seal, Error::Cancelled));
        }
        let sealer = self.sealer.clone();
        let compress = class_policy.compress;
        let sealed = timed(
            class,
            Stage::Seal,
            self.timeouts.seal,
            run_blocking(move || sealer.seal(&verified, compress, encrypt)),
        )
        .await;
        let sealed = match sealed {
            Ok(a) => a,
            Err(e) => {
                discard(&raw_path).await;
                let e = match e {
                    Error::SealFailed(_) | Error::StageTimeout { .. } => e,
                    other => Error::SealFailed(other.to_string()),
                };
                return Err(StageFailure::new(Stage::Seal, e));
            }
        };
        debug!(%class, size = sealed.size_bytes, compressed = sealed.compressed, encrypted = sealed.encrypted, "Artifact sealed");

        let sealed_path = sealed.local_path.clone();
        let sealed = match self.verify(sealed, verify_policy).await {
            Ok(a) => a,
            Err(e) => {
                discard(&sealed_path).await;
                return Err(StageFailure::new(Stage::Verify, e));
            }
        };

        let publisher = match (&self.publisher, upload) {
            (Some(publisher), true) => publisher,
            _ if cancel.is_cancelled() => {
                discard(&sealed_path).await;
                return Err(StageFailure::new(Stage::Seal, Error::Cancelled));
            }
            _ => return Ok(sealed),
        };
        if cancel.is_cancelled() {
            return Err(StageFailure {
                stage: Stage::Publish,
                error: Error::Cancelled,
                artifact: Some(sealed),
            });
        }
        let timer = StageTimer::new(class, Stage::Publish);
        let published = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = publisher.publish(&sealed) => r,
        };
        timer.finish(&published);
        published.map_err(|error| StageFailure {
            stage: Stage::Publish,
            error,
            artifact: Some(sealed),
        })
    }

    async fn verify(&self, artifact: Artifact, policy: VerifyPolicy) -> Result<Artifact> {
        let verifier = self.verifier.clone();
        timed(
            artifact.class,
            Stage::Verify,
            self.timeouts.verify,
            run_blocking(move || {
                verifier.verify(&artifact, &policy)?;
                Ok(mark_verified(artifact))
            }),
        )
        .await
    }
}

fn collect_capture(
    results: &mut BTreeMap<ArtifactClass, Result<Artifact>>,
    joined: std::result::Result<(ArtifactClass, Result<Artifact>), tokio::task::JoinError>,
) {
    match joined {
        Ok((class, result)) => {
            results.insert(class, result);
        }
        Err(e) => error!(error = %e, "Capture task failed"),
    }
}

/// Capture one class with retries on transient failures.
async fn capture_one(
    adapter: Arc<dyn SourceAdapter>,
    snapshot_id: SnapshotId,
    dest: PathBuf,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<Artifact> {
    let class = adapter.class();
    let timer = StageTimer::new(class, Stage::Capture);
    let result = retry
        .run(
            "capture",
            |attempt| {
                let adapter = Arc::clone(&adapter);
                let snapshot_id = &snapshot_id;
                let dest = &dest;
                let cancel = &cancel;
                async move {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    if attempt > 1 {
                        let _ = tokio::fs::remove_file(dest).await;
                    }
                    adapter.capture(snapshot_id, dest, cancel).await
                }
            },
            |attempt, outcome| match outcome {
                Ok(a) => debug!(%class, attempt, size = a.size_bytes, "Captured"),
                Err(e) => warn!(%class, attempt, error = %e, "Capture attempt failed"),
            },
        )
        .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&dest).await;
    }
    timer.finish(&result);
    result
}

/// Every capture so far must fall inside the window, and the application
/// must still report itself drained.
async fn confirm_window(guard: &QuiesceGuard, captured: &BTreeMap<ArtifactClass, Artifact>) -> Result<()> {
    for artifact in captured.values() {
        if artifact.created_at < guard.opened_at() {
            return Err(Error::ConsistencyWindow(format!(
                "{} captured at {} before the application drained at {}",
                artifact.class,
                artifact.created_at.to_rfc3339(),
                guard.opened_at().to_rfc3339()
            )));
        }
    }
    match guard.still_drained().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ConsistencyWindow(
            "application stopped reporting drained during capture".into(),
        )),
        Err(e) => Err(Error::ConsistencyWindow(format!(
            "could not confirm the application is still drained: {}",
            e
        ))),
    }
}

fn record_captures(
    manifest: &mut SnapshotManifest,
    results: BTreeMap<ArtifactClass, Result<Artifact>>,
) -> BTreeMap<ArtifactClass, Artifact> {
    let mut captured = BTreeMap::new();
    for (class, result) in results {
        match result {
            Ok(artifact) => {
                captured.insert(class, artifact);
            }
            Err(e) => record_failure(manifest, class, Stage::Capture, &e, None),
        }
    }
    captured
}

fn record_failure(
    manifest: &mut SnapshotManifest,
    class: ArtifactClass,
    stage: Stage,
    err: &Error,
    artifact: Option<Artifact>,
) {
    if let Err(e) = manifest.record_failure(class, ClassFailure::from_error(stage, err), artifact) {
        error!(%class, error = %e, "Could not record class failure");
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove rejected artifact");
        }
    }
}

async fn checksum_matches(path: &Path, expected: &str) -> Result<bool> {
    let path = path.to_path_buf();
    let expected = expected.to_string();
    run_blocking(move || Ok(sha256_file(&path).is_ok_and(|(sum, _)| sum == expected))).await
}

async fn bounded<T>(stage: Stage, limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::StageTimeout {
            stage: stage.to_string(),
            timeout: limit,
        }),
    }
}

async fn timed<T>(
    class: ArtifactClass,
    stage: Stage,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let timer = StageTimer::new(class, stage);
    let result = bounded(stage, limit, fut).await;
    timer.finish(&result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DocumentsAdapter;
    use crate::manifest::{ClassState, FailureKind};
    use std::fs;
    use tempfile::TempDir;

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.backup_root = root.join("backups");
        config.defaults.stop_for_vector_backup = false;
        config.sources.capture_backoff_ms = 1;
        config
    }

    fn docs(root: &Path) -> PathBuf {
        let dir = root.join("docs");
        fs::create_dir_all(dir.join("2026")).unwrap();
        fs::write(dir.join("2026/a.pdf"), vec![1u8; 300]).unwrap();
        fs::write(dir.join("b.txt"), "b").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_backup_documents_complete() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();

        let report = coordinator
            .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());
        let artifact = report.manifest.artifact(ArtifactClass::Documents).unwrap();
        assert!(artifact.verified);
        assert!(artifact.compressed);
        assert!(artifact.local_path.exists());
        assert!(artifact.local_path.to_string_lossy().ends_with(".tar.zst"));

        // Persisted and final
        let loaded = coordinator.manifests().load(&report.manifest.snapshot_id).await.unwrap();
        assert_eq!(loaded.status, ManifestStatus::Complete);
    }

    #[tokio::test]
    async fn test_sequence_increments_within_second() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let a = coordinator.run_backup(BackupRequest::new("prod"), &cancel).await.unwrap();
        let b = coordinator.run_backup(BackupRequest::new("prod"), &cancel).await.unwrap();
        assert_ne!(a.manifest.snapshot_id, b.manifest.snapshot_id);
    }

    #[tokio::test]
    async fn test_missing_source_fails_class() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(temp.path());
        cfg.sources.capture_attempts = 2;
        let coordinator = CoordinatorBuilder::new(cfg)
            .adapter(Arc::new(DocumentsAdapter::new(temp.path().join("absent"))))
            .build()
            .unwrap();

        let report = coordinator
            .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status(), ManifestStatus::Failed);
        let entry = &report.manifest.classes[&ArtifactClass::Documents];
        assert_eq!(entry.state, ClassState::Failed);
        assert_eq!(entry.failure.as_ref().unwrap().kind, FailureKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_unconfigured_class_is_rejected_before_locking() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        let err = coordinator
            .run_backup(
                BackupRequest::new("prod").with_classes(vec![ArtifactClass::Metadata]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!temp.path().join("backups/prod/.keeper.lock").exists());
    }

    #[tokio::test]
    async fn test_disabled_environment_refuses() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(temp.path());
        cfg.defaults.enable_backups = false;
        let coordinator = CoordinatorBuilder::new(cfg)
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        assert!(matches!(
            coordinator
                .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
                .await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_quiesce_without_application_is_config_error() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        let err = coordinator
            .run_backup(BackupRequest::new("prod").with_quiesce(true), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_fails_every_class() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator.run_backup(BackupRequest::new("prod"), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.status(), ManifestStatus::Failed);
        let failure = report.manifest.classes[&ArtifactClass::Documents]
            .failure
            .clone()
            .unwrap();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        // Manifest still persisted, lock released
        assert!(coordinator.manifests().local_path(&report.manifest.snapshot_id).exists());
        assert!(!temp.path().join("backups/prod/.keeper.lock").exists());
    }

    /// Cancels the run as soon as anything shows up in the documents
    /// staging directory.
    struct Tripwire {
        watch: PathBuf,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for Tripwire {
        fn class(&self) -> ArtifactClass {
            ArtifactClass::Metadata
        }

        fn shape(&self) -> crate::artifact::ArtifactShape {
            crate::artifact::ArtifactShape::Stream
        }

        async fn capture(&self, _: &SnapshotId, _: &Path, _: &CancellationToken) -> Result<Artifact> {
            for _ in 0..5000 {
                let seen = fs::read_dir(&self.watch).map(|mut d| d.next().is_some()).unwrap_or(false);
                if seen {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            self.cancel.cancel();
            Err(Error::Cancelled)
        }

        async fn restore(&self, _: &Artifact, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mid_capture_leaves_no_staged_files() {
        let temp = TempDir::new().unwrap();
        let docs = docs(temp.path());
        for i in 0..3000 {
            fs::write(docs.join(format!("bulk-{i:04}.txt")), vec![b'x'; 1024]).unwrap();
        }
        let staging = temp.path().join("backups/prod/documents");
        let cancel = CancellationToken::new();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs)))
            .adapter(Arc::new(Tripwire {
                watch: staging.clone(),
                cancel: cancel.clone(),
            }))
            .build()
            .unwrap();

        let report = coordinator.run_backup(BackupRequest::new("prod"), &cancel).await.unwrap();

        assert!(report.cancelled);
        assert!(report.manifest.artifact(ArtifactClass::Documents).is_none());
        let left: Vec<_> = fs::read_dir(&staging)
            .map(|d| d.map(|e| e.unwrap().file_name()).collect())
            .unwrap_or_default();
        assert!(left.is_empty(), "staged files left behind: {left:?}");
    }

    #[tokio::test]
    async fn test_restore_refuses_incomplete_without_override() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(temp.path().join("absent"))))
            .build()
            .unwrap();
        let report = coordinator
            .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
            .await
            .unwrap();

        let err = coordinator
            .run_restore(
                RestoreRequest::new(report.manifest.snapshot_id.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManifestNotComplete { .. }));

        let mut request = RestoreRequest::new(report.manifest.snapshot_id.clone());
        request.allow_partial = true;
        let restored = coordinator
            .run_restore(request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            restored.classes[&ArtifactClass::Documents],
            ClassRestore::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_verify_snapshot_detects_damage() {
        let temp = TempDir::new().unwrap();
        let coordinator = CoordinatorBuilder::new(config(temp.path()))
            .adapter(Arc::new(DocumentsAdapter::new(docs(temp.path()))))
            .build()
            .unwrap();
        let report = coordinator
            .run_backup(BackupRequest::new("prod"), &CancellationToken::new())
            .await
            .unwrap();
        let id = report.manifest.snapshot_id.clone();

        let healthy = coordinator.verify_snapshot(&id).await.unwrap();
        assert!(healthy.healthy());

        let path = report.manifest.artifact(ArtifactClass::Documents).unwrap().local_path.clone();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let damaged = coordinator.verify_snapshot(&id).await.unwrap();
        assert!(!damaged.healthy());
        assert!(matches!(
            damaged.classes[&ArtifactClass::Documents].local,
            CheckOutcome::Corrupt(_)
        ));
    }
}
