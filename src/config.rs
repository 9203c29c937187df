use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cache::CacheTtls;
use crate::offline::SyncPolicy;
use crate::retry::RetryPolicy;

/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub batch: BatchConfig,
  pub retry: RetryConfig,
  pub offline: OfflineConfig,
  pub storage: StorageConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the PyKIDS backend
  pub url: String,
  /// Path probed to decide whether the backend is reachable
  pub health_path: String,
  pub timeouts: TimeoutConfig,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5000/".to_string(),
      health_path: "/".to_string(),
      timeouts: TimeoutConfig::default(),
    }
  }
}

/// Per-request timeouts, in seconds. A timeout surfaces as a network failure.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
  pub default_secs: u64,
  /// Profile writes and other upload-class requests
  pub upload_secs: u64,
  /// Batched progress writes
  pub batch_secs: u64,
}

impl Default for TimeoutConfig {
  fn default() -> Self {
    Self {
      default_secs: 10,
      upload_secs: 30,
      batch_secs: 15,
    }
  }
}

impl TimeoutConfig {
  pub fn default_timeout(&self) -> Duration {
    Duration::from_secs(self.default_secs)
  }

  pub fn upload_timeout(&self) -> Duration {
    Duration::from_secs(self.upload_secs)
  }

  pub fn batch_timeout(&self) -> Duration {
    Duration::from_secs(self.batch_secs)
  }
}

/// Cache TTLs in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub profile_ttl_secs: u64,
  pub progress_ttl_secs: u64,
  pub analytics_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      profile_ttl_secs: 5 * 60,
      progress_ttl_secs: 2 * 60,
      analytics_ttl_secs: 10 * 60,
    }
  }
}

impl CacheConfig {
  pub fn ttls(&self) -> CacheTtls {
    CacheTtls {
      profile: Duration::from_secs(self.profile_ttl_secs),
      progress: Duration::from_secs(self.progress_ttl_secs),
      analytics: Duration::from_secs(self.analytics_ttl_secs),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
  /// A batch reaching this many updates is flushed without waiting
  pub max_batch_size: usize,
  /// Quiet period after the last enqueue before all batches flush
  pub delay_ms: u64,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      max_batch_size: 10,
      delay_ms: 2000,
    }
  }
}

impl BatchConfig {
  pub fn delay(&self) -> Duration {
    Duration::from_millis(self.delay_ms)
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub backoff_multiplier: f64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      backoff_multiplier: 2.0,
      max_delay_ms: 10_000,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_retries: self.max_retries,
      base_delay: Duration::from_millis(self.base_delay_ms),
      backoff_multiplier: self.backoff_multiplier,
      max_delay: Duration::from_millis(self.max_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Keep unsent work (offline writes, abandoned retries) for later replay
  pub enabled: bool,
  pub sync_policy: SyncPolicy,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      sync_policy: SyncPolicy::default(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file for persisted queues (default: $XDG_DATA_HOME/pykids/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Seconds between health probes; 0 disables probing
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Option<Duration> {
    (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pykids.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pykids/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => {
        info!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pykids.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pykids").join("config.yaml");
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
    // serde_yaml rejects an empty document
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }
}
