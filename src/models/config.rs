//! Configuration models for relaysync.
//!
//! Every tunable of the pipeline lives here and is resolved from a TOML file
//! at startup. Each field carries a default so a minimal config only names
//! the source, the staging directory and at least one sink.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Top-level configuration for relaysync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source being mirrored (one channel per pipeline instance)
    #[serde(default)]
    pub source: SourceConfig,

    /// Local staging area and disk budget
    #[serde(default)]
    pub staging: StagingConfig,

    /// Stage worker pools and queue sizing
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Retry and backoff behaviour
    #[serde(default)]
    pub retry: RetryConfig,

    /// Checkpoint persistence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Upload destinations; cleanup waits for all of them
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Source identity and location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Numeric channel / source identifier
    #[serde(default)]
    pub id: i64,

    /// Display name
    #[serde(default = "default_source_name")]
    pub name: String,

    /// JSONL manifest listing the source items
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

fn default_source_name() -> String {
    "default".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: default_source_name(),
            manifest: None,
        }
    }
}

/// Staging directory and disk budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory where downloaded items wait for upload
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,

    /// Disk budget in GB (ignored when `max_bytes` is set)
    #[serde(default = "default_max_gb")]
    pub max_gb: f64,

    /// Exact disk budget in bytes
    #[serde(default)]
    pub max_bytes: Option<u64>,

    /// How often the staging directory is rescanned
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long the download stage waits for space before logging again
    #[serde(default = "default_space_wait_secs")]
    pub space_wait_secs: u64,

    /// Resume downloads only below this fraction of the budget.
    /// Unset means pause and resume share the same threshold.
    #[serde(default)]
    pub resume_ratio: Option<f64>,
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

fn default_max_gb() -> f64 {
    10.0
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_space_wait_secs() -> u64 {
    30
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            max_gb: default_max_gb(),
            max_bytes: None,
            poll_interval_ms: default_poll_interval_ms(),
            space_wait_secs: default_space_wait_secs(),
            resume_ratio: None,
        }
    }
}

impl StagingConfig {
    /// Effective disk budget in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
            .unwrap_or_else(|| (self.max_gb * BYTES_PER_GB) as u64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn space_wait(&self) -> Duration {
        Duration::from_secs(self.space_wait_secs)
    }
}

/// Stage worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent upload workers
    #[serde(default = "default_upload_workers")]
    pub upload: usize,

    /// Capacity of each hand-off queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_upload_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    16
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload: default_upload_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Budget-consuming failures tolerated per stage before an item fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout applied to each individual remote call
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// First transient backoff; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Transient backoff ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Cooldown used when a rate-limit response carries no hint
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,

    /// Stage-wide suspension after a quota error
    #[serde(default = "default_quota_cooldown_secs")]
    pub quota_cooldown_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    1_800
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_rate_limit_cooldown_ms() -> u64 {
    60_000
}

fn default_quota_cooldown_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            quota_cooldown_secs: default_quota_cooldown_secs(),
        }
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding the checkpoint log
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Timer-driven save interval
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,

    /// Save after every N cleaned items (0 disables)
    #[serde(default = "default_every_cleaned")]
    pub every_cleaned: u64,

    /// Upper bound on a single checkpoint write
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Entries kept in the checkpoint log before compaction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_every_cleaned() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_max_entries() -> usize {
    100
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            interval_secs: default_checkpoint_interval_secs(),
            every_cleaned: default_every_cleaned(),
            write_timeout_secs: default_write_timeout_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Upload destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Name used in logs and in per-item confirmations
    pub name: String,

    /// Root directory; items land in `<root>/<YYYY-MM-DD>/`
    pub root: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.upload == 0 {
            return Err(ConfigError::Invalid(
                "workers.upload must be at least 1".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.staging.max_bytes() == 0 {
            return Err(ConfigError::Invalid(
                "staging budget must be greater than zero".to_string(),
            ));
        }
        if let Some(ratio) = self.staging.resume_ratio {
            if !(0.0..=1.0).contains(&ratio) || ratio == 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "staging.resume_ratio must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.staging.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "staging.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        for (key, value) in [
            ("staging.space_wait_secs", self.staging.space_wait_secs),
            ("checkpoint.interval_secs", self.checkpoint.interval_secs),
            ("checkpoint.write_timeout_secs", self.checkpoint.write_timeout_secs),
            ("retry.attempt_timeout_secs", self.retry.attempt_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        let mut names: Vec<&str> = self.sinks.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::DuplicateSink(dup[0].to_string()));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Sink name configured twice: '{0}'")]
    DuplicateSink(String),

    #[error("No sinks configured (add at least one [[sinks]] entry)")]
    NoSinks,

    #[error("No source manifest configured (set source.manifest)")]
    NoManifest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
[source]
id = 42
name = "archive"

[[sinks]]
name = "drive"
root = "/mnt/drive"
"#,
        )
        .unwrap();

        assert_eq!(config.source.id, 42);
        assert_eq!(config.workers.upload, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.checkpoint.every_cleaned, 10);
        assert_eq!(config.retry.quota_cooldown_secs, 86_400);
        assert_eq!(config.staging.max_bytes(), 10 * 1024 * 1024 * 1024);
        assert!(config.staging.resume_ratio.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_explicit_byte_budget_wins() {
        let config = Config::from_toml(
            r#"
[staging]
max_gb = 1.0
max_bytes = 4096
"#,
        )
        .unwrap();
        assert_eq!(config.staging.max_bytes(), 4096);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.workers.upload = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.staging.resume_ratio = Some(1.5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.staging.space_wait_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("space_wait_secs")
        ));

        let mut config = Config::default();
        config.checkpoint.interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("interval_secs")
        ));

        let mut config = Config::default();
        config.retry.attempt_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.sinks = vec![
            SinkConfig {
                name: "a".to_string(),
                root: PathBuf::from("/a"),
            },
            SinkConfig {
                name: "a".to_string(),
                root: PathBuf::from("/b"),
            },
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateSink(name)) if name == "a"
        ));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[workers\nupload = ").unwrap();
        match Config::from_file(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
