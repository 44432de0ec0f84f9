//! Snapshot manifests: the durable record of a backup run.
//!
//! A manifest is created `in_progress` when a run starts, collects one entry
//! per requested class as pipeline stages finish, and is finalized to
//! `complete`, `partial` or `failed`. Once finalized it is never mutated.

mod store;

pub use store::ManifestStore;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::artifact::{Artifact, ArtifactClass};
use crate::error::{Error, Result};

/// Current on-disk manifest format.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// `{environment}-{timestamp}-{sequence}`, e.g. `prod-20260101T020000Z-001`.
///
/// Ordered by environment, then capture time, then sequence. The rendered
/// string only breaks ties between spellings of the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    raw: String,
    environment: String,
    timestamp: DateTime<Utc>,
    sequence: u32,
}

impl SnapshotId {
    pub fn new(environment: &str, timestamp: DateTime<Utc>, sequence: u32) -> Result<Self> {
        validate_environment(environment)?;
        // Second precision only
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();
        Self::parse(&format!("{}-{}-{:03}", environment, stamp, sequence))
    }

    /// Parse from the right: the environment may itself contain dashes.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidSnapshotId(s.to_string());

        let (rest, seq) = s.rsplit_once('-').ok_or_else(invalid)?;
        let (environment, stamp) = rest.rsplit_once('-').ok_or_else(invalid)?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let sequence: u32 = seq.parse().map_err(|_| invalid())?;
        let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
        validate_environment(environment).map_err(|_| invalid())?;

        Ok(Self {
            raw: s.to_string(),
            environment: environment.to_string(),
            timestamp: Utc.from_utc_datetime(&naive),
            sequence,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Environment names end up in file paths and object keys.
pub fn validate_environment(environment: &str) -> Result<()> {
    let ok = !environment.is_empty()
        && environment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !environment.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid environment name '{}': use letters, digits, '-' and '_'",
            environment
        )))
    }
}

impl Ord for SnapshotId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.environment
            .cmp(&other.environment)
            .then(self.timestamp.cmp(&other.timestamp))
            .then(self.sequence.cmp(&other.sequence))
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for SnapshotId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        SnapshotId::parse(&value)
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.raw
    }
}

impl std::str::FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SnapshotId::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    InProgress,
    Complete,
    Partial,
    Failed,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::InProgress => "in_progress",
            ManifestStatus::Complete => "complete",
            ManifestStatus::Partial => "partial",
            ManifestStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, ManifestStatus::InProgress)
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage in which a class failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Quiesce,
    Capture,
    Verify,
    Seal,
    Publish,
    Restore,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Quiesce => "quiesce",
            Stage::Capture => "capture",
            Stage::Verify => "verify",
            Stage::Seal => "seal",
            Stage::Publish => "publish",
            Stage::Restore => "restore",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    CaptureCorrupt,
    VerificationFailed,
    SealFailed,
    PublishFailed,
    RestoreFailed,
    QuiesceTimeout,
    ConsistencyWindow,
    StageTimeout,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnavailable => "source_unavailable",
            FailureKind::CaptureCorrupt => "capture_corrupt",
            FailureKind::VerificationFailed => "verification_failed",
            FailureKind::SealFailed => "seal_failed",
            FailureKind::PublishFailed => "publish_failed",
            FailureKind::RestoreFailed => "restore_failed",
            FailureKind::QuiesceTimeout => "quiesce_timeout",
            FailureKind::ConsistencyWindow => "consistency_window",
            FailureKind::StageTimeout => "stage_timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl ClassFailure {
    pub fn from_error(stage: Stage, err: &Error) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassState {
    Pending,
    Succeeded,
    Failed,
}

/// Outcome of one requested class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub state: ClassState,
    /// The artifact as far as the pipeline got. A failed publish keeps the
    /// verified local artifact here with `remote_location` unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ClassFailure>,
}

impl ClassEntry {
    fn pending() -> Self {
        Self {
            state: ClassState::Pending,
            artifact: None,
            failure: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == ClassState::Succeeded
    }
}

/// Half-open interval during which the application was drained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuiesceWindow {
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    pub snapshot_id: SnapshotId,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    pub status: ManifestStatus,
    pub application_quiesced: bool,
    /// Whether the application was confirmed resumed (only meaningful when quiesced)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_resumed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiesce_window: Option<QuiesceWindow>,
    pub classes: BTreeMap<ArtifactClass, ClassEntry>,
    /// Run-level reason for a failed run (quiesce timeout, cancellation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub keeper_version: String,
}

impl SnapshotManifest {
    pub fn new(snapshot_id: SnapshotId, classes: &[ArtifactClass], quiesce: bool) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            environment: snapshot_id.environment().to_string(),
            snapshot_id,
            created_at: Utc::now(),
            finalized_at: None,
            status: ManifestStatus::InProgress,
            application_quiesced: quiesce,
            application_resumed: None,
            quiesce_window: None,
            classes: classes.iter().map(|c| (*c, ClassEntry::pending())).collect(),
            abort_reason: None,
            keeper_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    fn entry_mut(&mut self, class: ArtifactClass) -> Result<&mut ClassEntry> {
        if self.is_final() {
            return Err(Error::ManifestFinalized(self.snapshot_id.to_string()));
        }
        self.classes.get_mut(&class).ok_or_else(|| {
            Error::Config(format!(
                "Class {} was not requested in snapshot {}",
                class, self.snapshot_id
            ))
        })
    }

    pub fn record_success(&mut self, artifact: Artifact) -> Result<()> {
        if artifact.snapshot_id != self.snapshot_id {
            return Err(Error::Config(format!(
                "Artifact belongs to {}, not {}",
                artifact.snapshot_id, self.snapshot_id
            )));
        }
        if !artifact.verified {
            return Err(Error::VerificationFailed(format!(
                "{} artifact of {} is not verified",
                artifact.class, self.snapshot_id
            )));
        }
        let entry = self.entry_mut(artifact.class)?;
        entry.state = ClassState::Succeeded;
        entry.artifact = Some(artifact);
        entry.failure = None;
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        class: ArtifactClass,
        failure: ClassFailure,
        artifact: Option<Artifact>,
    ) -> Result<()> {
        let entry = self.entry_mut(class)?;
        entry.state = ClassState::Failed;
        entry.failure = Some(failure);
        if artifact.is_some() {
            entry.artifact = artifact;
        }
        Ok(())
    }

    /// Fail every class that has not reported yet.
    pub fn fail_pending(&mut self, failure: &ClassFailure) {
        if self.is_final() {
            return;
        }
        for entry in self.classes.values_mut() {
            if entry.state == ClassState::Pending {
                entry.state = ClassState::Failed;
                entry.failure = Some(failure.clone());
            }
        }
    }

    /// Compute the final status. Leftover pending classes count as failed.
    pub fn finalize(&mut self) -> ManifestStatus {
        if self.is_final() {
            return self.status;
        }
        self.fail_pending(&ClassFailure {
            stage: Stage::Capture,
            kind: FailureKind::Internal,
            message: "class never reported an outcome".to_string(),
        });

        let total = self.classes.len();
        let ok = self.classes.values().filter(|e| e.succeeded()).count();
        self.status = if total > 0 && ok == total {
            ManifestStatus::Complete
        } else if ok > 0 {
            ManifestStatus::Partial
        } else {
            ManifestStatus::Failed
        };
        self.finalized_at = Some(Utc::now());
        self.status
    }

    /// Succeeded artifact for a class, if any.
    pub fn artifact(&self, class: ArtifactClass) -> Option<&Artifact> {
        self.classes
            .get(&class)
            .filter(|e| e.succeeded())
            .and_then(|e| e.artifact.as_ref())
    }

    pub fn succeeded_classes(&self) -> Vec<ArtifactClass> {
        self.classes
            .iter()
            .filter(|(_, e)| e.succeeded())
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn failed_classes(&self) -> Vec<ArtifactClass> {
        self.classes
            .iter()
            .filter(|(_, e)| e.state == ClassState::Failed)
            .map(|(c, _)| *c)
            .collect()
    }

    /// Requested classes this manifest cannot restore.
    pub fn unrestorable(&self, classes: &[ArtifactClass]) -> Vec<ArtifactClass> {
        classes
            .iter()
            .filter(|c| self.artifact(**c).is_none())
            .copied()
            .collect()
    }

    /// Restorable without override only when complete and covering every requested class.
    pub fn is_restorable_for(&self, classes: &[ArtifactClass]) -> bool {
        self.status == ManifestStatus::Complete && self.unrestorable(classes).is_empty()
    }

    /// Number of artifacts that reached remote storage.
    pub fn published_count(&self) -> usize {
        self.classes
            .values()
            .filter(|e| {
                e.artifact
                    .as_ref()
                    .is_some_and(|a| a.remote_location.is_some())
            })
            .count()
    }
}
