use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 60;
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_STORE_WRITE_ATTEMPTS: u32 = 3;
pub const ENV_PREFIX: &str = "NETOPS_";

/// Top-level config (netops.toml + NETOPS_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetopsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. `:memory:` keeps everything in-process.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// `path` with a leading `~` replaced by `$HOME`.
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// Tunables for the scheduling loop and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Jobs whose next trigger falls within `now + lookahead_secs` are due.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Export/import target used by save_config / load_config.
    #[serde(default = "default_jobs_file")]
    pub jobs_file: Option<String>,
    #[serde(default = "bool_true")]
    pub load_jobs_on_start: bool,
    #[serde(default = "bool_true")]
    pub save_jobs_on_stop: bool,
    /// How many times a history insert is attempted before giving up.
    #[serde(default = "default_store_write_attempts")]
    pub store_write_attempts: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            lookahead_secs: DEFAULT_LOOKAHEAD_SECS,
            max_workers: DEFAULT_MAX_WORKERS,
            jobs_file: default_jobs_file(),
            load_jobs_on_start: true,
            save_jobs_on_stop: true,
            store_write_attempts: DEFAULT_STORE_WRITE_ATTEMPTS,
        }
    }
}

impl SchedulerSettings {
    pub fn jobs_file_path(&self) -> Option<PathBuf> {
        self.jobs_file.as_deref().map(expand_home)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CoreError::Config(
                "scheduler.max_workers must be at least 1".to_string(),
            ));
        }
        if self.tick_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }
        if self.store_write_attempts == 0 {
            return Err(CoreError::Config(
                "scheduler.store_write_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_lookahead_secs() -> u64 {
    DEFAULT_LOOKAHEAD_SECS
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_store_write_attempts() -> u32 {
    DEFAULT_STORE_WRITE_ATTEMPTS
}
fn default_db_path() -> String {
    "~/.netops/scheduler.db".to_string()
}
fn default_jobs_file() -> Option<String> {
    Some("~/.netops/jobs.json".to_string())
}

impl NetopsConfig {
    /// Load config from a TOML file with NETOPS_* env var overrides.
    ///
    /// Nested keys use a double underscore in the environment:
    /// `NETOPS_SCHEDULER__MAX_WORKERS=8`. A missing file is not an error;
    /// defaults fill every key the file and environment leave out.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path.display(), exists = path.exists(), "loading config");

        Self::figment(&path)
            .extract::<NetopsConfig>()
            .map_err(|e| CoreError::Config(e.to_string()))
            .and_then(|config| {
                config.scheduler.validate()?;
                Ok(config)
            })
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(NetopsConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

/// `~/.netops/netops.toml`
pub fn default_config_path() -> PathBuf {
    expand_home("~/.netops/netops.toml")
}

/// Replace a leading `~` with `$HOME` (or `.` when HOME is unset).
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(format!("{home}{rest}"))
        }
        None => PathBuf::from(path),
    }
}
