//! Backup observability metrics
//!
//! Recorded through the `metrics` facade; no exporter is installed here,
//! the driver decides whether and where to expose them.

use std::time::{Duration, Instant};

use crate::artifact::ArtifactClass;
use crate::manifest::{FailureKind, ManifestStatus, Stage};

/// Record a finished backup run by final manifest status
pub fn record_backup_run(environment: &str, status: ManifestStatus) {
    metrics::counter!(
        "keeper_backup_runs_total",
        "environment" => environment.to_string(),
        "status" => status.as_str(),
    )
    .increment(1);
}

/// Record a class that ended a run in the failed state
pub fn record_class_failure(environment: &str, class: ArtifactClass, stage: Stage, kind: FailureKind) {
    metrics::counter!(
        "keeper_class_failures_total",
        "environment" => environment.to_string(),
        "class" => class.as_str(),
        "stage" => stage.as_str(),
        "kind" => kind.as_str(),
    )
    .increment(1);
}

/// Record how long one pipeline stage took for one class
pub fn record_stage_duration(class: ArtifactClass, stage: Stage, success: bool, duration: Duration) {
    metrics::histogram!(
        "keeper_stage_duration_seconds",
        "class" => class.as_str(),
        "stage" => stage.as_str(),
        "status" => if success { "ok" } else { "error" },
    )
    .record(duration.as_secs_f64());
}

/// Record a single upload attempt
pub fn record_publish_attempt(class: ArtifactClass, success: bool) {
    metrics::counter!(
        "keeper_publish_attempts_total",
        "class" => class.as_str(),
        "status" => if success { "ok" } else { "error" },
    )
    .increment(1);
}

/// Record an artifact copy removed by retention or explicit deletion
pub fn record_pruned(environment: &str, class: ArtifactClass, location: &'static str) {
    metrics::counter!(
        "keeper_pruned_artifacts_total",
        "environment" => environment.to_string(),
        "class" => class.as_str(),
        "location" => location,
    )
    .increment(1);
}

/// Times one stage of one class; records on `finish`.
pub struct StageTimer {
    class: ArtifactClass,
    stage: Stage,
    start: Instant,
}

impl StageTimer {
    pub fn new(class: ArtifactClass, stage: Stage) -> Self {
        Self {
            class,
            stage,
            start: Instant::now(),
        }
    }

    pub fn finish<T, E>(self, result: &std::result::Result<T, E>) {
        record_stage_duration(self.class, self.stage, result.is_ok(), self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_timer() {
        let timer = StageTimer::new(ArtifactClass::Documents, Stage::Capture);
        std::thread::sleep(Duration::from_millis(1));
        timer.finish::<(), ()>(&Ok(()));
    }

    #[test]
    fn test_recorders_without_exporter() {
        record_backup_run("prod", ManifestStatus::Partial);
        record_class_failure(
            "prod",
            ArtifactClass::VectorIndex,
            Stage::Publish,
            FailureKind::PublishFailed,
        );
        record_publish_attempt(ArtifactClass::Metadata, false);
        record_pruned("prod", ArtifactClass::Documents, "remote");
    }
}
