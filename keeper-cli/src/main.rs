use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keeper::config::{default_config_path, ObservabilityConfig};
use keeper::{ArtifactClass, Config, Coordinator, SnapshotId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "keeper")]
#[command(about = "Keeper - backup and restore for metadata, documents and vector index")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: ~/.keeper/config.toml)
    #[arg(short, long, env = "KEEPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture, verify, seal and publish a snapshot
    Backup {
        /// Target environment
        #[arg(short, long)]
        env: String,

        /// Classes to back up (comma-separated, default: all configured)
        #[arg(long)]
        classes: Option<String>,

        #[command(flatten)]
        quiesce: QuiesceArgs,

        /// Retention override for the post-backup prune, e.g. documents=14
        #[arg(long = "retention", value_parser = parse_retention)]
        retention: Vec<(ArtifactClass, u32)>,
    },

    /// Restore live stores from a snapshot
    Restore {
        /// Snapshot to restore, e.g. production-20260101T020000Z-001
        snapshot: SnapshotId,

        /// Classes to restore (comma-separated, default: all in the snapshot)
        #[arg(long)]
        classes: Option<String>,

        /// Restore the usable classes of a partial or failed snapshot
        #[arg(long)]
        allow_partial: bool,

        #[command(flatten)]
        quiesce: QuiesceArgs,
    },

    /// Delete artifacts outside the retention windows
    Prune {
        #[arg(short, long)]
        env: String,

        /// Retention override, e.g. vector_index=7
        #[arg(long = "retention", value_parser = parse_retention)]
        retention: Vec<(ArtifactClass, u32)>,
    },

    /// List snapshots of an environment, newest first
    List {
        #[arg(short, long)]
        env: String,
    },

    /// Re-check the local and remote copies of a snapshot
    Verify { snapshot: SnapshotId },

    /// Delete one snapshot's artifacts and manifest
    Delete { snapshot: SnapshotId },
}

#[derive(clap::Args, Debug)]
struct QuiesceArgs {
    /// Drain the application for the run
    #[arg(long, conflicts_with = "no_quiesce")]
    quiesce: bool,

    /// Never drain the application
    #[arg(long)]
    no_quiesce: bool,
}

impl QuiesceArgs {
    fn resolve(&self) -> Option<bool> {
        match (self.quiesce, self.no_quiesce) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

fn parse_retention(s: &str) -> std::result::Result<(ArtifactClass, u32), String> {
    let (class, days) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=DAYS, got '{}'", s))?;
    let class: ArtifactClass = class.trim().parse()?;
    let days = days
        .trim()
        .parse()
        .map_err(|e| format!("invalid day count '{}': {}", days, e))?;
    Ok((class, days))
}

fn parse_classes(classes: Option<&str>) -> Result<Vec<ArtifactClass>> {
    match classes {
        Some(list) => Ok(ArtifactClass::parse_list(list)?),
        None => Ok(Vec::new()),
    }
}

/// Install the global subscriber. `RUST_LOG` and `LOG_FORMAT` win over the config.
fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| observability.log_format.clone());

    // Reports go to stdout, so logs stay on stderr
    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::load_or_create(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    init_tracing(&config.observability);
    tracing::debug!(path = %config_path.display(), "Config loaded");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling the run");
            interrupt.cancel();
        }
    });

    let coordinator = Coordinator::from_config(config).context("Failed to set up the coordinator")?;

    let succeeded = match cli.command {
        Commands::Backup {
            env,
            classes,
            quiesce,
            retention,
        } => {
            let mut request = keeper::BackupRequest::new(env)
                .with_classes(parse_classes(classes.as_deref())?)
                .with_retention(retention.into_iter().collect::<BTreeMap<_, _>>());
            request.quiesce = quiesce.resolve();
            commands::run_backup(&coordinator, request, &cancel, cli.json).await?
        }
        Commands::Restore {
            snapshot,
            classes,
            allow_partial,
            quiesce,
        } => {
            let mut request = keeper::RestoreRequest::new(snapshot);
            request.classes = parse_classes(classes.as_deref())?;
            request.allow_partial = allow_partial;
            request.quiesce = quiesce.resolve();
            commands::run_restore(&coordinator, request, &cancel, cli.json).await?
        }
        Commands::Prune { env, retention } => {
            let overrides: BTreeMap<_, _> = retention.into_iter().collect();
            commands::run_prune(&coordinator, &env, &overrides, cli.json).await?
        }
        Commands::List { env } => commands::run_list(&coordinator, &env, cli.json).await?,
        Commands::Verify { snapshot } => commands::run_verify(&coordinator, &snapshot, cli.json).await?,
        Commands::Delete { snapshot } => commands::run_delete(&coordinator, &snapshot, cli.json).await?,
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retention() {
        assert_eq!(
            parse_retention("documents=14").unwrap(),
            (ArtifactClass::Documents, 14)
        );
        assert_eq!(
            parse_retention("vector-index = 3").unwrap(),
            (ArtifactClass::VectorIndex, 3)
        );
        assert!(parse_retention("documents").is_err());
        assert!(parse_retention("documents=-1").is_err());
        assert!(parse_retention("tapes=1").is_err());
    }

    #[test]
    fn test_cli_parses_backup() {
        let cli = Cli::try_parse_from([
            "keeper",
            "backup",
            "--env",
            "production",
            "--classes",
            "metadata,docs",
            "--no-quiesce",
            "--retention",
            "metadata=60",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup {
                env,
                classes,
                quiesce,
                retention,
            } => {
                assert_eq!(env, "production");
                assert_eq!(
                    parse_classes(classes.as_deref()).unwrap(),
                    vec![ArtifactClass::Metadata, ArtifactClass::Documents]
                );
                assert_eq!(quiesce.resolve(), Some(false));
                assert_eq!(retention, vec![(ArtifactClass::Metadata, 60)]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_quiesce_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "keeper",
            "backup",
            "--env",
            "production",
            "--quiesce",
            "--no-quiesce",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_restore_rejects_malformed_snapshot_id() {
        assert!(Cli::try_parse_from(["keeper", "restore", "not-a-snapshot"]).is_err());
        let cli = Cli::try_parse_from([
            "keeper",
            "restore",
            "production-20260101T020000Z-001",
            "--allow-partial",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Restore { allow_partial: true, .. }));
    }
}
