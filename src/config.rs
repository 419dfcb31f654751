use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proxy::Generation;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub gateway: GatewayConfig,
  /// Origin that relative proxy paths resolve against
  pub origin: String,
  pub store: StoreConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  /// Directory for daily-rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  /// Base of the restaurants and reviews endpoints
  pub url: String,
  pub timeout_secs: u64,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:1337".to_string(),
      timeout_secs: 30,
    }
  }
}

impl GatewayConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Defaults to the platform data directory
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub path: Option<PathBuf>,
  pub family: String,
  pub version: u32,
  pub third_party: String,
  /// App shell resources cached on install
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      family: "mws-restaurant".to_string(),
      version: 14,
      third_party: "GOOGLE_MAPS_CACHE".to_string(),
      precache: [
        "/index.html",
        "/restaurant.html",
        "/css/styles.css",
        "/js/dbhelper.js",
        "/js/main.js",
        "/js/restaurant_info.js",
        "/img/10.jpg",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

impl CacheConfig {
  pub fn generation(&self) -> Generation {
    Generation::new(self.family.clone(), self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
    }
  }
}

impl SyncConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file, falling back to defaults when none exists.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./restaurant-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/restaurant-sync/config.yaml
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    if config.origin.is_empty() {
      config.origin = "http://localhost:8000".to_string();
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("restaurant-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("restaurant-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    // An empty file is valid and means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Cache database path, next to the store by default.
  pub fn cache_path(&self) -> Option<PathBuf> {
    self.cache.path.clone().or_else(|| {
      dirs::data_dir().map(|d| d.join("restaurant-sync").join("cache.db"))
    })
  }
}
