use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{LayerSettings, SqliteStorage};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend endpoint every action is posted to
  pub url: Option<String>,
  /// Timeout applied by the HTTP client itself
  #[serde(default = "default_api_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: None,
      timeout_secs: default_api_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file shared by every context (default: $XDG_DATA_HOME/swrcache/storage.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_minutes")]
  pub default_ttl_minutes: u32,
  /// Per-action TTL overrides, in minutes
  #[serde(default)]
  pub ttl: BTreeMap<String, u32>,
  /// Bound on a single network refresh; 0 disables it
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  /// Bound on waiting for another caller's refresh; 0 disables it
  #[serde(default = "default_gate_wait_secs")]
  pub gate_wait_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_minutes: default_ttl_minutes(),
      ttl: BTreeMap::new(),
      request_timeout_secs: default_request_timeout_secs(),
      gate_wait_secs: default_gate_wait_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Use the in-process broadcast bus
  #[serde(default = "default_true")]
  pub channel: bool,
  /// Use durable marker rows in the shared storage
  #[serde(default = "default_true")]
  pub marker: bool,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Per-action signal name overrides
  #[serde(default)]
  pub signals: BTreeMap<String, String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      channel: true,
      marker: true,
      poll_interval_ms: default_poll_interval_ms(),
      signals: BTreeMap::new(),
    }
  }
}

impl SyncConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily-rotated logs here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_api_timeout_secs() -> u64 {
  30
}

fn default_ttl_minutes() -> u32 {
  crate::cache::DEFAULT_TTL_MINUTES
}

fn default_request_timeout_secs() -> u64 {
  60
}

fn default_gate_wait_secs() -> u64 {
  90
}

fn default_true() -> bool {
  true
}

fn default_poll_interval_ms() -> u64 {
  500
}

fn default_log_level() -> String {
  "info".to_string()
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
  (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swrcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swrcache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swrcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swrcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Storage file to open.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Query layer tunables, with config overrides applied over the defaults.
  pub fn layer_settings(&self) -> LayerSettings {
    let mut settings = LayerSettings {
      default_ttl_minutes: self.cache.default_ttl_minutes,
      request_timeout: non_zero_secs(self.cache.request_timeout_secs),
      gate_wait: non_zero_secs(self.cache.gate_wait_secs),
      ..LayerSettings::default()
    };

    settings.ttl_by_action.extend(self.cache.ttl.clone());
    settings.signal_by_action.extend(self.sync.signals.clone());
    settings
  }

  /// Get the API session token from the environment.
  ///
  /// Checks SWRCACHE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("SWRCACHE_API_TOKEN").ok()
  }
}
