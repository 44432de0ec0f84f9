use anyhow::{Context, Result};
use keeper::Coordinator;

use super::{format_bytes, print_json};

/// List snapshots of an environment, newest first.
pub async fn run_list(coordinator: &Coordinator, environment: &str, json: bool) -> Result<bool> {
    let manifests = coordinator
        .list_snapshots(environment)
        .await
        .with_context(|| format!("Failed to list snapshots of '{}'", environment))?;

    if json {
        print_json(&manifests)?;
        return Ok(true);
    }

    if manifests.is_empty() {
        println!("No snapshots for '{}'", environment);
        return Ok(true);
    }

    println!(
        "{:<40} {:<12} {:<26} {:>10}  classes",
        "SNAPSHOT", "STATUS", "CREATED", "SIZE"
    );
    for manifest in &manifests {
        let size: u64 = manifest
            .classes
            .values()
            .filter_map(|e| e.artifact.as_ref())
            .map(|a| a.size_bytes)
            .sum();
        let classes = manifest
            .classes
            .iter()
            .map(|(class, entry)| {
                if entry.succeeded() {
                    class.to_string()
                } else {
                    format!("{}(failed)", class)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<40} {:<12} {:<26} {:>10}  {}",
            manifest.snapshot_id.as_str(),
            manifest.status.as_str(),
            manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            format_bytes(size),
            classes
        );
    }
    Ok(true)
}
