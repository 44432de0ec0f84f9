//! Restore command implementation.

use anyhow::{Context, Result};
use keeper::coordinator::ClassRestore;
use keeper::{Coordinator, RestoreReport, RestoreRequest};
use tokio_util::sync::CancellationToken;

use super::{describe_failure, print_json};

/// Restore a snapshot into the live stores. Returns whether no class failed.
pub async fn run_restore(
    coordinator: &Coordinator,
    request: RestoreRequest,
    cancel: &CancellationToken,
    json: bool,
) -> Result<bool> {
    let snapshot_id = request.snapshot_id.clone();
    let report = coordinator
        .run_restore(request, cancel)
        .await
        .with_context(|| format!("Restore of {} refused", snapshot_id))?;

    if json {
        print_json(&report)?;
    } else {
        print_summary(&report);
    }
    Ok(report.succeeded())
}

fn print_summary(report: &RestoreReport) {
    println!();
    println!("Snapshot:  {} ({})", report.snapshot_id, report.manifest_status);
    if let Some(resumed) = report.application_resumed {
        println!("Resumed:   {}", if resumed { "yes" } else { "NO" });
    }
    println!();
    for (class, outcome) in &report.classes {
        match outcome {
            ClassRestore::Restored { source } => {
                println!("  {:<14} restored from {:?}", class, source)
            }
            ClassRestore::Skipped { reason } => println!("  {:<14} skipped: {}", class, reason),
            ClassRestore::Failed { failure } => {
                println!("  {:<14} FAILED  {}", class, describe_failure(failure))
            }
        }
    }
    if report.cancelled {
        println!();
        println!("Restore was cancelled");
    }
}
