//! Prune and delete command implementations.

use anyhow::{Context, Result};
use keeper::retention::DeletionOutcome;
use keeper::{ArtifactClass, Coordinator, PruneReport, SnapshotId};
use std::collections::BTreeMap;

use super::print_json;

/// Apply retention to an environment. Returns false if any deletion failed.
pub async fn run_prune(
    coordinator: &Coordinator,
    environment: &str,
    overrides: &BTreeMap<ArtifactClass, u32>,
    json: bool,
) -> Result<bool> {
    let report = coordinator
        .prune(environment, overrides)
        .await
        .with_context(|| format!("Prune of '{}' failed", environment))?;
    emit(&report, json)?;
    Ok(!report.has_failures())
}

/// Delete a single snapshot.
pub async fn run_delete(coordinator: &Coordinator, id: &SnapshotId, json: bool) -> Result<bool> {
    let report = coordinator
        .delete_snapshot(id)
        .await
        .with_context(|| format!("Cannot delete {}", id))?;
    emit(&report, json)?;
    Ok(!report.has_failures())
}

fn emit(report: &PruneReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!();
    for (class, id) in &report.retained {
        println!("  newest complete {:<14} {}", class, id);
    }
    if report.artifacts.is_empty() {
        println!("Nothing to delete");
    }
    for pruned in &report.artifacts {
        println!(
            "  {} {:<14} local: {}  remote: {}",
            pruned.snapshot_id,
            pruned.class,
            outcome(&pruned.local),
            outcome(&pruned.remote)
        );
    }
    for id in &report.manifests_removed {
        println!("Removed manifest {}", id);
    }
    for (id, error) in &report.manifest_errors {
        println!("Manifest {} kept: {}", id, error);
    }
    Ok(())
}

fn outcome(o: &DeletionOutcome) -> String {
    match o {
        DeletionOutcome::Deleted => "deleted".into(),
        DeletionOutcome::NotPresent => "absent".into(),
        DeletionOutcome::NotApplicable => "-".into(),
        DeletionOutcome::Skipped(why) => format!("skipped ({})", why),
        DeletionOutcome::Failed(why) => format!("FAILED ({})", why),
    }
}
