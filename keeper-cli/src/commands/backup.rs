//! Backup command implementation.

use anyhow::{Context, Result};
use keeper::manifest::ClassState;
use keeper::{BackupReport, BackupRequest, Coordinator};
use tokio_util::sync::CancellationToken;

use super::{describe_failure, format_bytes, print_json};

/// Run one backup and print its report. Returns whether every class succeeded.
pub async fn run_backup(
    coordinator: &Coordinator,
    request: BackupRequest,
    cancel: &CancellationToken,
    json: bool,
) -> Result<bool> {
    let environment = request.environment.clone();
    let report = coordinator
        .run_backup(request, cancel)
        .await
        .with_context(|| format!("Backup of '{}' did not start", environment))?;

    if json {
        print_json(&report)?;
    } else {
        print_summary(&report);
    }
    Ok(report.succeeded())
}

fn print_summary(report: &BackupReport) {
    let manifest = &report.manifest;
    println!();
    println!("Snapshot:  {}", manifest.snapshot_id);
    println!("Status:    {}", manifest.status);
    if manifest.application_quiesced {
        println!(
            "Quiesced:  yes (resumed: {})",
            match manifest.application_resumed {
                Some(true) => "yes",
                Some(false) => "NO",
                None => "unknown",
            }
        );
    }
    if let Some(reason) = &manifest.abort_reason {
        println!("Aborted:   {}", reason);
    }
    println!();

    for (class, entry) in &manifest.classes {
        match (entry.state, &entry.artifact, &entry.failure) {
            (ClassState::Succeeded, Some(artifact), _) => println!(
                "  {:<14} ok      {:>10}  {}",
                class,
                format_bytes(artifact.size_bytes),
                artifact
                    .remote_location
                    .as_deref()
                    .unwrap_or_else(|| artifact.local_path.to_str().unwrap_or("-"))
            ),
            (_, _, Some(failure)) => {
                println!("  {:<14} FAILED  {}", class, describe_failure(failure))
            }
            _ => println!("  {:<14} {:?}", class, entry.state),
        }
    }

    if let Some(location) = &report.manifest_location {
        println!();
        println!("Manifest mirrored to {}", location);
    }
    if let Some(error) = &report.mirror_error {
        println!("Manifest mirror failed: {}", error);
    }
    if let Some(prune) = &report.prune {
        println!(
            "Pruned {} artifact(s), removed {} manifest(s)",
            prune.artifacts.len(),
            prune.manifests_removed.len()
        );
    }
    if let Some(error) = &report.prune_error {
        println!("Prune failed: {}", error);
    }
    if report.cancelled {
        println!("Run was cancelled");
    }
}
