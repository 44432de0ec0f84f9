//! Relational metadata store adapter, driving the database's native dump and
//! restore tools as child processes.

use async_trait::async_trait;
use chrono::Utc;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::SourceAdapter;
use crate::artifact::{Artifact, ArtifactClass, ArtifactShape};
use crate::config::{CommandSpec, MetadataSourceConfig};
use crate::error::{Error, Result};
use crate::manifest::SnapshotId;
use crate::run_blocking;

const DEST_PLACEHOLDER: &str = "{dest}";
const SOURCE_PLACEHOLDER: &str = "{source}";

/// How much of the dump tail is searched for the completion marker.
const MARKER_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelationalDumpAdapter {
    dump: CommandSpec,
    restore: CommandSpec,
    completion_marker: Option<String>,
}

impl RelationalDumpAdapter {
    pub fn new(dump: CommandSpec, restore: CommandSpec) -> Self {
        Self {
            dump,
            restore,
            completion_marker: None,
        }
    }

    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_marker = Some(marker.into());
        self
    }

    pub fn from_config(config: &MetadataSourceConfig) -> Self {
        Self {
            dump: config.dump.clone(),
            restore: config.restore.clone(),
            completion_marker: config.completion_marker.clone(),
        }
    }
}

/// Build a command, substituting `placeholder` with `path`. Returns whether
/// the placeholder was present.
fn build_command(spec: &CommandSpec, placeholder: &str, path: &Path) -> (Command, bool) {
    let path_str = path.to_string_lossy();
    let mut substituted = false;
    let args: Vec<String> = spec
        .args
        .iter()
        .map(|a| {
            if a.contains(placeholder) {
                substituted = true;
                a.replace(placeholder, &path_str)
            } else {
                a.clone()
            }
        })
        .collect();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&args).envs(&spec.env).kill_on_drop(true);
    (cmd, substituted)
}

/// Run to completion keeping the configured stdio; only piped streams are
/// collected into the returned output.
async fn spawn_and_wait(cmd: &mut Command) -> std::io::Result<std::process::Output> {
    cmd.spawn()?.wait_with_output().await
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(499)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[async_trait]
impl SourceAdapter for RelationalDumpAdapter {
    fn class(&self) -> ArtifactClass {
        ArtifactClass::Metadata
    }

    fn shape(&self) -> ArtifactShape {
        ArtifactShape::Stream
    }

    #[instrument(skip(self, cancel), fields(program = %self.dump.program))]
    async fn capture(
        &self,
        snapshot_id: &SnapshotId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (mut cmd, to_path) = build_command(&self.dump, DEST_PLACEHOLDER, dest);
        if to_path {
            cmd.stdout(Stdio::null());
        } else {
            let file = tokio::fs::File::create(dest).await?.into_std().await;
            cmd.stdout(Stdio::from(file));
        }
        cmd.stdin(Stdio::null()).stderr(Stdio::piped());

        // `output()` would re-pipe stdout over the file redirect
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            waited = spawn_and_wait(&mut cmd) => Some(waited),
        };
        let output = match waited {
            // The dropped child is killed
            None => {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(Error::Cancelled);
            }
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(Error::SourceUnavailable(format!(
                    "Cannot run {}: {}",
                    self.dump.program, e
                )));
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::SourceUnavailable(format!(
                "{} exited with {}: {}",
                self.dump.program,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        let dest: PathBuf = dest.to_path_buf();
        let marker = self.completion_marker.clone();
        let snapshot_id = snapshot_id.clone();
        let artifact = run_blocking(move || {
            check_dump(&dest, marker.as_deref())?;
            Artifact::from_capture(
                ArtifactClass::Metadata,
                snapshot_id,
                ArtifactShape::Stream,
                dest,
                Utc::now(),
            )
        })
        .await?;

        debug!(size = artifact.size_bytes, "Metadata dump captured");
        Ok(artifact)
    }

    #[instrument(skip(self, artifact), fields(program = %self.restore.program, snapshot_id = %artifact.snapshot_id))]
    async fn restore(&self, artifact: &Artifact, raw: &Path) -> Result<()> {
        let (mut cmd, from_path) = build_command(&self.restore, SOURCE_PLACEHOLDER, raw);
        if from_path {
            cmd.stdin(Stdio::null());
        } else {
            let file = tokio::fs::File::open(raw).await?.into_std().await;
            cmd.stdin(Stdio::from(file));
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let output = spawn_and_wait(&mut cmd).await.map_err(|e| {
            Error::RestoreFailed(format!("Cannot run {}: {}", self.restore.program, e))
        })?;

        if !output.status.success() {
            return Err(Error::RestoreFailed(format!(
                "{} exited with {}: {}",
                self.restore.program,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        info!("Metadata restored");
        Ok(())
    }
}

/// A dump that exited cleanly can still be empty or cut short.
fn check_dump(path: &Path, marker: Option<&str>) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(Error::CaptureCorrupt("dump is empty".into()));
    }

    if let Some(marker) = marker {
        let start = len.saturating_sub(MARKER_WINDOW);
        file.seek(SeekFrom::Start(start))?;
        let mut tail = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut tail)?;
        if !String::from_utf8_lossy(&tail).contains(marker) {
            return Err(Error::CaptureCorrupt(format!(
                "dump does not end with completion marker '{}'",
                marker
            )));
        }
    }
    Ok(())
}
