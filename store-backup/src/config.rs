//! Configuration for the backup pipeline.
//!
//! Loaded from a TOML file; [`Config::for_data_dir`] builds the default layout
//! rooted at the application data directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEngine {
    /// SQLite database; snapshots use the online backup API.
    Sqlite,
    /// Opaque file copied as-is.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// The live data file the application opens
    pub live_path: PathBuf,

    #[serde(default = "default_engine")]
    pub engine: DataEngine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Archive directory for artifacts and the catalog
    pub dir: PathBuf,

    /// Consecutive failed attempts before health reports `failing`
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Retries for transient I/O errors
    #[serde(default = "default_max_io_retries")]
    pub max_io_retries: u32,

    /// Upload attempts per record before giving up
    #[serde(default = "default_max_upload_attempts")]
    pub max_upload_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Isolated directory holding at most one staged file
    pub staging_dir: PathBuf,

    /// Canonical path of the pending-restore descriptor
    pub intent_path: PathBuf,

    /// Keep `<live>.pre-restore` with the data replaced by a restore
    #[serde(default = "default_true")]
    pub keep_pre_restore_copy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_retention_count")]
    pub retention_count: usize,

    /// Cron expression for the daemon's tick
    #[serde(default = "default_tick_cron")]
    pub tick_cron: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Http,
    Dir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub kind: RemoteKind,

    /// Base URL for `http`
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for `http`
    #[serde(default)]
    pub token: Option<String>,

    /// Target directory for `dir`
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Upper bound for a single upload or download over `http`
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_engine() -> DataEngine {
    DataEngine::Sqlite
}

fn default_remote_timeout_secs() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_io_retries() -> u32 {
    3
}

fn default_max_upload_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_retention_count() -> usize {
    7
}

fn default_tick_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_interval_secs(),
            retention_count: default_retention_count(),
            tick_cron: default_tick_cron(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default layout under one application data directory.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Config {
            data: DataConfig {
                live_path: data_dir.join("store.db"),
                engine: default_engine(),
            },
            backup: BackupConfig {
                dir: data_dir.join("backups"),
                failure_threshold: default_failure_threshold(),
                max_io_retries: default_max_io_retries(),
                max_upload_attempts: default_max_upload_attempts(),
            },
            restore: RestoreConfig {
                staging_dir: data_dir.join("restore-staging"),
                intent_path: data_dir.join("restore-intent.json"),
                keep_pre_restore_copy: true,
            },
            schedule: ScheduleConfig::default(),
            remote: None,
            log: LogConfig::default(),
        }
    }

    /// Reject layouts where the staging area could collide with other state.
    pub fn validate(&self) -> Result<()> {
        let live = &self.data.live_path;
        let backups = &self.backup.dir;
        let staging = &self.restore.staging_dir;

        if staging.starts_with(backups) || backups.starts_with(staging) {
            return Err(BackupError::Config(format!(
                "staging dir {} must be separate from backup dir {}",
                staging.display(),
                backups.display()
            )));
        }
        if live.starts_with(staging) || live.starts_with(backups) {
            return Err(BackupError::Config(format!(
                "live data {} must not live inside the staging or backup dir",
                live.display()
            )));
        }
        if self.restore.intent_path.starts_with(staging) {
            return Err(BackupError::Config(
                "intent descriptor must not live inside the staging dir".into(),
            ));
        }
        if self.schedule.retention_count == 0 {
            return Err(BackupError::Config("retention_count must be at least 1".into()));
        }
        if self.schedule.interval_secs == 0 {
            return Err(BackupError::Config("interval_secs must be positive".into()));
        }
        if let Some(remote) = &self.remote {
            match remote.kind {
                RemoteKind::Http if remote.url.is_none() => {
                    return Err(BackupError::Config("remote.url is required for http".into()))
                }
                RemoteKind::Dir if remote.dir.is_none() => {
                    return Err(BackupError::Config("remote.dir is required for dir".into()))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.backup.dir)?;
        std::fs::create_dir_all(&self.restore.staging_dir)?;
        for path in [&self.data.live_path, &self.restore.intent_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
