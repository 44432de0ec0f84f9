//! Verify command implementation.

use anyhow::{Context, Result};
use keeper::coordinator::CheckOutcome;
use keeper::{Coordinator, SnapshotId};

use super::print_json;

/// Re-check both copies of a snapshot. Returns whether every class is healthy.
pub async fn run_verify(coordinator: &Coordinator, id: &SnapshotId, json: bool) -> Result<bool> {
    let report = coordinator
        .verify_snapshot(id)
        .await
        .with_context(|| format!("Cannot verify {}", id))?;

    if json {
        print_json(&report)?;
        return Ok(report.healthy());
    }

    println!();
    println!("Snapshot:  {} ({})", report.snapshot_id, report.status);
    println!();
    for (class, check) in &report.classes {
        println!(
            "  {:<14} local: {:<24} remote: {:<24} {}",
            class,
            describe(&check.local),
            describe(&check.remote),
            if check.is_healthy() { "ok" } else { "DAMAGED" }
        );
    }
    Ok(report.healthy())
}

fn describe(outcome: &CheckOutcome) -> String {
    match outcome {
        CheckOutcome::Ok => "ok".into(),
        CheckOutcome::Missing => "missing".into(),
        CheckOutcome::NotApplicable => "-".into(),
        CheckOutcome::Corrupt(why) => format!("corrupt ({})", why),
        CheckOutcome::Error(why) => format!("error ({})", why),
    }
}
