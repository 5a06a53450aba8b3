//! # spacebox-config
//!
//! Configuration management for Spacebox.
//!
//! Loads configuration from:
//! 1. `~/.spacebox/config.toml` (global)
//! 2. `.spacebox/config.toml` (local, merged over global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

pub const ENV_DATA_PATH: &str = "SPACEBOX_DATA_PATH";
pub const ENV_SHARED_PATH: &str = "SPACEBOX_SHARED_PATH";
pub const ENV_TOPOLOGY_FILE: &str = "SPACEBOX_TOPOLOGY_FILE";
pub const ENV_BUCKET: &str = "SPACEBOX_BUCKET";
pub const ENV_RESERVED_SPACE: &str = "SPACEBOX_RESERVED_SPACE";
pub const ENV_MULTIPART_LIFECYCLE: &str = "SPACEBOX_MULTIPART_LIFECYCLE";
pub const ENV_ASYNC_THRESHOLD: &str = "SPACEBOX_ASYNC_THRESHOLD";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub multipart: MultipartConfig,
    pub notify: NotifyConfig,
    pub tasks: TaskConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        // 1. Global config (~/.spacebox/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut merged, read_table(&global_path)?);
            }
        }

        // 2. Local config (.spacebox/config.toml), merged key by key
        let local_path = Self::local_config_path();
        if local_path.exists() {
            debug!("Loading local config from {:?}", local_path);
            merge_tables(&mut merged, read_table(&local_path)?);
        }

        let mut config: Config = toml::Value::Table(merged).try_into()?;

        // 3. Environment variable overrides
        config.apply_overrides(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    /// Load a single config file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::Value::Table(read_table(path)?).try_into()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Global config path: ~/.spacebox/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".spacebox/config.toml"))
    }

    /// Local config path: ./.spacebox/config.toml
    pub fn local_config_path() -> PathBuf {
        PathBuf::from(".spacebox/config.toml")
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DATA_PATH) {
            self.storage.data_root = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_SHARED_PATH) {
            self.storage.shared_root = PathBuf::from(path);
        }
        if let Some(path) = lookup(ENV_TOPOLOGY_FILE) {
            self.storage.topology_file = Some(PathBuf::from(path));
        }
        if let Some(bucket) = lookup(ENV_BUCKET) {
            self.storage.bucket = bucket;
        }
        if let Some(v) = lookup(ENV_RESERVED_SPACE) {
            self.storage.reserved_space = parse_env(ENV_RESERVED_SPACE, v)?;
        }
        if let Some(v) = lookup(ENV_MULTIPART_LIFECYCLE) {
            self.multipart.lifecycle_secs = parse_env(ENV_MULTIPART_LIFECYCLE, v)?;
        }
        if let Some(v) = lookup(ENV_ASYNC_THRESHOLD) {
            self.tasks.async_threshold = parse_env(ENV_ASYNC_THRESHOLD, v)?;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents.parse::<toml::Table>()?)
}

/// Recursively merge `overlay` into `base`; overlay wins on leaves.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which every disk is mounted
    pub data_root: PathBuf,
    /// Shared system directory holding the disk topology
    pub shared_root: PathBuf,
    /// Disk topology descriptor (defaults to `{shared_root}/disk_info.json`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology_file: Option<PathBuf>,
    /// Bucket for finalized objects
    pub bucket: String,
    /// Free space kept untouched on every disk (bytes)
    pub reserved_space: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            shared_root: PathBuf::from("/shared"),
            topology_file: None,
            bucket: "eulixspace-files".to_string(),
            reserved_space: 4_831_838_208,
        }
    }
}

impl StorageConfig {
    pub fn topology_path(&self) -> PathBuf {
        self.topology_file
            .clone()
            .unwrap_or_else(|| self.shared_root.join("disk_info.json"))
    }

    /// Directory holding multipart task snapshots.
    pub fn multipart_meta_dir(&self) -> PathBuf {
        self.data_root.join("multipart-meta")
    }
}

/// Multipart upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Inactivity after which an in-memory task is evicted
    pub idle_timeout_secs: u64,
    /// Age after which an orphaned task snapshot is deleted
    pub lifecycle_secs: u64,
    /// Period of the maintenance sweep
    pub sweep_interval_secs: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            lifecycle_secs: 30 * 24 * 3600,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl MultipartConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn lifecycle(&self) -> Duration {
        Duration::from_secs(self.lifecycle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Change notification publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 60,
            retry_backoff_ms: 1000,
        }
    }
}

impl NotifyConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Background task tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Batch size above which an operation runs in the background
    pub async_threshold: usize,
    /// Concurrently running background jobs
    pub max_concurrent: usize,
    /// How long a finished job's result is kept for polling
    pub result_ttl_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            async_threshold: 1000,
            max_concurrent: 4,
            result_ttl_secs: 10 * 60,
        }
    }
}

impl TaskConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}
