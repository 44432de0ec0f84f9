//! Configuration management for keeper
//!
//! Default config location: ~/.keeper/config.toml
//!
//! Policy toggles live in `[defaults]` and may be overridden per environment
//! in `[environments.<name>]`; `Config::policy_for` resolves the two.

mod storage;

pub use storage::{RemoteStorageConfig, S3StorageConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact::ArtifactClass;
use crate::error::{Error, Result};
use crate::manifest::validate_environment;
use crate::retention::RetentionPolicy;
use crate::verify::VerifyPolicy;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding local artifacts, manifests and run locks
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
    #[serde(default)]
    pub defaults: PolicyConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, PolicyOverrides>,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub remote: RemoteStorageConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
}

fn default_backup_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keeper")
        .join("backups")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            defaults: PolicyConfig::default(),
            environments: BTreeMap::new(),
            sources: SourcesConfig::default(),
            application: ApplicationConfig::default(),
            remote: RemoteStorageConfig::default(),
            publish: PublishConfig::default(),
            encryption: EncryptionConfig::default(),
            timeouts: TimeoutConfig::default(),
            observability: ObservabilityConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Backup policy toggles, named after the deployment inventory variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enable_backups: bool,
    /// Drain the application before capturing the vector index
    #[serde(default = "default_true")]
    pub stop_for_vector_backup: bool,
    #[serde(default = "default_true")]
    pub compress_backups: bool,
    /// Run structural probes in addition to checksum recomputation
    #[serde(default = "default_true")]
    pub verify_backups: bool,
    #[serde(default)]
    pub encrypt_backups: bool,
    #[serde(default = "default_true")]
    pub cleanup_old_backups: bool,
    #[serde(default)]
    pub upload_to_remote: bool,
    #[serde(default)]
    pub retention_days: RetentionDays,
    /// Per-class compress/verify overrides
    #[serde(default)]
    pub classes: BTreeMap<ArtifactClass, ClassOverrides>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enable_backups: true,
            stop_for_vector_backup: true,
            compress_backups: true,
            verify_backups: true,
            encrypt_backups: false,
            cleanup_old_backups: true,
            upload_to_remote: false,
            retention_days: RetentionDays::default(),
            classes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetentionDays {
    #[serde(default = "default_metadata_days")]
    pub metadata: u32,
    #[serde(default = "default_documents_days")]
    pub documents: u32,
    #[serde(default = "default_vector_days")]
    pub vector_index: u32,
}

fn default_metadata_days() -> u32 {
    30
}

fn default_documents_days() -> u32 {
    30
}

fn default_vector_days() -> u32 {
    14
}

impl Default for RetentionDays {
    fn default() -> Self {
        Self {
            metadata: default_metadata_days(),
            documents: default_documents_days(),
            vector_index: default_vector_days(),
        }
    }
}

impl RetentionDays {
    pub fn get(&self, class: ArtifactClass) -> u32 {
        match class {
            ArtifactClass::Metadata => self.metadata,
            ArtifactClass::Documents => self.documents,
            ArtifactClass::VectorIndex => self.vector_index,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ClassOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
}

/// `[environments.<name>]`: every field falls back to `[defaults]`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_for_vector_backup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_old_backups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_to_remote: Option<bool>,
    #[serde(default)]
    pub retention_days: BTreeMap<ArtifactClass, u32>,
    #[serde(default)]
    pub classes: BTreeMap<ArtifactClass, ClassOverrides>,
}

/// Resolved per-class policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassPolicy {
    pub compress: bool,
    pub verify: bool,
    pub retention_days: u32,
}

/// Policy for one environment after merging defaults and overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentPolicy {
    pub environment: String,
    pub enabled: bool,
    pub quiesce: bool,
    pub encrypt: bool,
    pub cleanup: bool,
    pub upload: bool,
    pub classes: BTreeMap<ArtifactClass, ClassPolicy>,
}

impl EnvironmentPolicy {
    pub fn class(&self, class: ArtifactClass) -> ClassPolicy {
        self.classes.get(&class).copied().unwrap_or(ClassPolicy {
            compress: true,
            verify: true,
            retention_days: RetentionDays::default().get(class),
        })
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(
            self.classes
                .iter()
                .map(|(class, p)| (*class, p.retention_days))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    /// Attempts per capture when the source reports itself unavailable
    #[serde(default = "default_capture_attempts")]
    pub capture_attempts: u32,
    #[serde(default = "default_capture_backoff_ms")]
    pub capture_backoff_ms: u64,
    #[serde(default)]
    pub metadata: Option<MetadataSourceConfig>,
    #[serde(default)]
    pub documents: Option<DirectorySourceConfig>,
    #[serde(default)]
    pub vector_index: Option<VectorIndexSourceConfig>,
}

fn default_capture_attempts() -> u32 {
    3
}

fn default_capture_backoff_ms() -> u64 {
    1000
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            capture_attempts: default_capture_attempts(),
            capture_backoff_ms: default_capture_backoff_ms(),
            metadata: None,
            documents: None,
            vector_index: None,
        }
    }
}

/// External command invocation. `{dest}` and `{source}` in `args` are
/// replaced with the artifact path; without a placeholder the dump is read
/// from stdout and the restore input is fed on stdin.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetadataSourceConfig {
    pub dump: CommandSpec,
    pub restore: CommandSpec,
    /// Text the dump must contain near its end (e.g. "PostgreSQL database dump complete")
    #[serde(default)]
    pub completion_marker: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectorySourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub min_files: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorIndexSourceConfig {
    pub path: PathBuf,
    /// Entries that must be present in the archive (relative paths)
    #[serde(default)]
    pub required_files: Vec<String>,
    #[serde(default = "default_vector_min_files")]
    pub min_files: usize,
}

fn default_vector_min_files() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Base URL of the application admin API; quiescing is unavailable when unset
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_drain_path")]
    pub drain_path: String,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_resume_path")]
    pub resume_path: String,
    /// Env var holding a bearer token for the admin API
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: u32,
}

fn default_drain_path() -> String {
    "/admin/maintenance/drain".to_string()
}

fn default_status_path() -> String {
    "/admin/maintenance/status".to_string()
}

fn default_resume_path() -> String {
    "/admin/maintenance/resume".to_string()
}

fn default_drain_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_resume_attempts() -> u32 {
    5
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            drain_path: default_drain_path(),
            status_path: default_status_path(),
            resume_path: default_resume_path(),
            auth_token_env: None,
            drain_timeout_secs: default_drain_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            resume_attempts: default_resume_attempts(),
        }
    }
}

impl ApplicationConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncryptionConfig {
    /// Env var holding the 32-byte key, hex or base64 encoded
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Identifier recorded in manifests; derived from the key when unset
    #[serde(default)]
    pub key_id: Option<String>,
}

fn default_key_env() -> String {
    "KEEPER_ENCRYPTION_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            key_id: None,
        }
    }
}

/// Per-stage timeouts, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_stage_secs")]
    pub capture_secs: u64,
    #[serde(default = "default_verify_secs")]
    pub verify_secs: u64,
    #[serde(default = "default_stage_secs")]
    pub seal_secs: u64,
    #[serde(default = "default_stage_secs")]
    pub publish_secs: u64,
    #[serde(default = "default_stage_secs")]
    pub restore_secs: u64,
    /// How long a run lock lease stays valid before it may be taken over
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
}

fn default_stage_secs() -> u64 {
    3600
}

fn default_verify_secs() -> u64 {
    1800
}

fn default_lock_lease_secs() -> u64 {
    6 * 3600
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_secs: default_stage_secs(),
            verify_secs: default_verify_secs(),
            seal_secs: default_stage_secs(),
            publish_secs: default_stage_secs(),
            restore_secs: default_stage_secs(),
            lock_lease_secs: default_lock_lease_secs(),
        }
    }
}

/// Resolved stage timeouts handed to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub capture: Duration,
    pub verify: Duration,
    pub seal: Duration,
    pub publish: Duration,
    pub restore: Duration,
    pub lock_lease: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        TimeoutConfig::default().resolve()
    }
}

impl TimeoutConfig {
    pub fn resolve(&self) -> StageTimeouts {
        StageTimeouts {
            capture: Duration::from_secs(self.capture_secs),
            verify: Duration::from_secs(self.verify_secs),
            seal: Duration::from_secs(self.seal_secs),
            publish: Duration::from_secs(self.publish_secs),
            restore: Duration::from_secs(self.restore_secs),
            lock_lease: Duration::from_secs(self.lock_lease_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,keeper=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionConfig {
    /// zstd level (1-22)
    #[serde(default = "default_zstd_level")]
    pub level: i32,
}

fn default_zstd_level() -> i32 {
    3
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: default_zstd_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    let home = || {
        dirs::home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".into()))
    };
    if let Some(rest) = s.strip_prefix("~/") {
        Ok(home()?.join(rest))
    } else if s == "~" {
        home()
    } else {
        Ok(path.to_path_buf())
    }
}

/// ~/.keeper/config.toml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".keeper")
        .join("config.toml")
}

impl Config {
    /// Load config from a file that must exist.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", config_path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            let mut config = Config::default();
            config.expand_paths()?;
            if let Err(e) = config.save(config_path) {
                tracing::warn!(path = %config_path.display(), error = %e, "Could not write default config");
            }
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Expand ~ in all paths
    fn expand_paths(&mut self) -> Result<()> {
        self.backup_root = expand_tilde(&self.backup_root)?;
        if let Some(ref mut docs) = self.sources.documents {
            docs.path = expand_tilde(&docs.path)?;
        }
        if let Some(ref mut vector) = self.sources.vector_index {
            vector.path = expand_tilde(&vector.path)?;
        }
        self.remote.expand_paths()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for name in self.environments.keys() {
            validate_environment(name)?;
        }
        if !(1..=22).contains(&self.compression.level) {
            return Err(Error::Config(format!(
                "compression.level must be 1-22, got {}",
                self.compression.level
            )));
        }
        if self.publish.max_attempts == 0 {
            return Err(Error::Config("publish.max_attempts must be at least 1".into()));
        }
        if self.sources.capture_attempts == 0 {
            return Err(Error::Config("sources.capture_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Merge `[defaults]` with `[environments.<environment>]`.
    pub fn policy_for(&self, environment: &str) -> Result<EnvironmentPolicy> {
        validate_environment(environment)?;
        let d = &self.defaults;
        let o = self.environments.get(environment).cloned().unwrap_or_default();

        let compress = o.compress_backups.unwrap_or(d.compress_backups);
        let verify = o.verify_backups.unwrap_or(d.verify_backups);

        let classes = ArtifactClass::ALL
            .iter()
            .map(|class| {
                let base = d.classes.get(class).copied().unwrap_or_default();
                let env = o.classes.get(class).copied().unwrap_or_default();
                let policy = ClassPolicy {
                    compress: env.compress.or(base.compress).unwrap_or(compress),
                    verify: env.verify.or(base.verify).unwrap_or(verify),
                    retention_days: o
                        .retention_days
                        .get(class)
                        .copied()
                        .unwrap_or_else(|| d.retention_days.get(*class)),
                };
                (*class, policy)
            })
            .collect();

        Ok(EnvironmentPolicy {
            environment: environment.to_string(),
            enabled: o.enable_backups.unwrap_or(d.enable_backups),
            quiesce: o.stop_for_vector_backup.unwrap_or(d.stop_for_vector_backup),
            encrypt: o.encrypt_backups.unwrap_or(d.encrypt_backups),
            cleanup: o.cleanup_old_backups.unwrap_or(d.cleanup_old_backups),
            upload: o.upload_to_remote.unwrap_or(d.upload_to_remote),
            classes,
        })
    }

    /// Structural verification policy per class.
    pub fn verify_policies(&self, policy: &EnvironmentPolicy) -> BTreeMap<ArtifactClass, VerifyPolicy> {
        ArtifactClass::ALL
            .iter()
            .map(|class| {
                let probe = policy.class(*class).verify;
                let vp = match class {
                    ArtifactClass::Metadata => VerifyPolicy {
                        probe,
                        ..VerifyPolicy::default()
                    },
                    ArtifactClass::Documents => VerifyPolicy {
                        probe,
                        min_entries: self.sources.documents.as_ref().map_or(0, |d| d.min_files),
                        ..VerifyPolicy::default()
                    },
                    ArtifactClass::VectorIndex => {
                        let src = self.sources.vector_index.as_ref();
                        VerifyPolicy {
                            probe,
                            required_entries: src.map(|v| v.required_files.clone()).unwrap_or_default(),
                            min_entries: src.map_or(0, |v| v.min_files),
                        }
                    }
                };
                (*class, vp)
            })
            .collect()
    }

    pub fn stage_timeouts(&self) -> StageTimeouts {
        self.timeouts.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
        backup_root = "/var/backups/keeper"

        [defaults]
        stop_for_vector_backup = true
        verify_backups = true
        upload_to_remote = true

        [defaults.retention_days]
        metadata = 30
        documents = 21
        vector_index = 7

        [defaults.classes.vector_index]
        compress = false

        [environments.staging]
        stop_for_vector_backup = false
        upload_to_remote = false
        cleanup_old_backups = false

        [environments.staging.retention_days]
        metadata = 3

        [environments.dev]
        enable_backups = false

        [sources.metadata]
        completion_marker = "dump complete"

        [sources.metadata.dump]
        program = "pg_dump"
        args = ["--format=plain", "dms"]

        [sources.metadata.restore]
        program = "psql"
        args = ["dms"]

        [sources.documents]
        path = "/srv/dms/documents"

        [sources.vector_index]
        path = "/srv/dms/vectors"
        required_files = ["meta.json"]
        min_files = 2

        [application]
        base_url = "http://127.0.0.1:8000"
        drain_timeout_secs = 30
    "#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.backup_root.to_string_lossy().contains(".keeper"));
        assert!(config.defaults.enable_backups);
        assert_eq!(config.defaults.retention_days.vector_index, 14);
        assert!(!config.remote.is_configured());
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.backup_root, PathBuf::from("/var/backups/keeper"));
        let meta = config.sources.metadata.as_ref().unwrap();
        assert_eq!(meta.dump.program, "pg_dump");
        assert_eq!(meta.completion_marker.as_deref(), Some("dump complete"));
        assert_eq!(config.application.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.application.drain_path, "/admin/maintenance/drain");
    }

    #[test]
    fn test_policy_defaults_apply() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let prod = config.policy_for("production").unwrap();
        assert!(prod.enabled);
        assert!(prod.quiesce);
        assert!(prod.upload);
        assert!(prod.cleanup);
        assert_eq!(prod.class(ArtifactClass::Documents).retention_days, 21);
        assert!(prod.class(ArtifactClass::Documents).compress);
        assert!(!prod.class(ArtifactClass::VectorIndex).compress);
    }

    #[test]
    fn test_policy_environment_overrides() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let staging = config.policy_for("staging").unwrap();
        assert!(!staging.quiesce);
        assert!(!staging.upload);
        assert!(!staging.cleanup);
        assert_eq!(staging.class(ArtifactClass::Metadata).retention_days, 3);
        assert_eq!(staging.class(ArtifactClass::VectorIndex).retention_days, 7);

        assert!(!config.policy_for("dev").unwrap().enabled);
        assert!(config.policy_for("bad/env").is_err());
    }

    #[test]
    fn test_verify_policies() {
        let config = Config::from_toml(SAMPLE).unwrap();
        let policy = config.policy_for("production").unwrap();
        let vps = config.verify_policies(&policy);
        let vector = &vps[&ArtifactClass::VectorIndex];
        assert!(vector.probe);
        assert_eq!(vector.required_entries, vec!["meta.json".to_string()]);
        assert_eq!(vector.min_entries, 2);
    }

    #[test]
    fn test_validation() {
        let bad = "[compression]\nlevel = 40\n";
        assert!(Config::from_toml(bad).is_err());
        let bad = "[environments.\"a/b\"]\n";
        assert!(Config::from_toml(bad).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf").join("config.toml");
        let config = Config::from_toml(SAMPLE).unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.backup_root, config.backup_root);
        assert_eq!(
            loaded.policy_for("staging").unwrap(),
            config.policy_for("staging").unwrap()
        );
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(config.defaults.enable_backups);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("/abs/path")).unwrap();
        assert_eq!(expanded, PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")).unwrap(), home.join("x"));
        }
    }
}
