use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::leader::ElectionTiming;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Where the shared stores live (defaults to $XDG_DATA_HOME/tabsync)
  pub data_dir: Option<PathBuf>,
  pub api: ApiConfig,
  pub leader: LeaderConfig,
  pub cache: CacheConfig,
  pub bridge: BridgeConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL queued mutations are replayed against
  pub base_url: Url,
  pub timeout_ms: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: Url::parse("http://localhost:8080/api/v1/").expect("static url is valid"),
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
  pub heartbeat_interval_ms: u64,
  pub stale_threshold_ms: u64,
  /// Stop claiming leadership while offline
  pub suspend_when_offline: bool,
}

impl Default for LeaderConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval_ms: 2000,
      stale_threshold_ms: 5000,
      suspend_when_offline: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_days: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { ttl_days: 7 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
  pub channel_name: String,
  pub capacity: usize,
}

impl Default for BridgeConfig {
  fn default() -> Self {
    Self {
      channel_name: "tabsync-events".to_string(),
      capacity: 256,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Write to a daily log file in the data directory instead of stderr
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tabsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tabsync/config.yaml
  ///
  /// Without any file every setting takes its default.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tabsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tabsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.leader.heartbeat_interval_ms == 0 {
      return Err(eyre!("leader.heartbeat_interval_ms must be positive"));
    }
    if self.leader.heartbeat_interval_ms >= self.leader.stale_threshold_ms {
      return Err(eyre!(
        "leader.heartbeat_interval_ms ({}) must be below leader.stale_threshold_ms ({})",
        self.leader.heartbeat_interval_ms,
        self.leader.stale_threshold_ms
      ));
    }
    if self.bridge.capacity == 0 {
      return Err(eyre!("bridge.capacity must be positive"));
    }
    Ok(())
  }

  /// Directory holding the shared stores and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tabsync"))
  }

  pub fn election_timing(&self) -> ElectionTiming {
    ElectionTiming {
      heartbeat_interval: Duration::from_millis(self.leader.heartbeat_interval_ms),
      stale_threshold: Duration::from_millis(self.leader.stale_threshold_ms),
    }
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.ttl_days.saturating_mul(24 * 60 * 60))
  }

  pub fn api_timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }
}
