use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::SqliteStorage;
use crate::worker::Strategy;

/// Environment variable that overrides the configured origin.
const ORIGIN_ENV: &str = "SHELLCACHE_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL that relative manifest entries and requests resolve against
  #[serde(default = "default_origin")]
  pub origin: String,
  /// Cache database location (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  #[serde(default)]
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
}

/// Settings handed to the cache manager at construction time.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the live cache generation; bump it to invalidate everything
  pub generation: String,
  /// App shell resources fetched at install time
  pub precache: Vec<String>,
  pub strategy: Strategy,
  /// Upper bound on any single network request
  pub network_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "control-salidas-cache-v4".to_string(),
      precache: ["/", "/index", "/scan", "/static/img/logo.png", "/static/img/avatar.png"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      strategy: Strategy::NetworkFirst,
      network_timeout_secs: 10,
    }
  }
}

impl CacheConfig {
  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }
}

fn default_origin() -> String {
  "http://localhost:5000".to_string()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      database: None,
      cache: CacheConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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

    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
      config.origin = origin;
    }

    // Validated by the caller once command line overrides are applied
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Reject settings the manager cannot work with.
  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.cache.generation.trim().is_empty() {
      return Err(eyre!("cache.generation must not be empty"));
    }
    if self.cache.network_timeout_secs == 0 {
      return Err(eyre!("cache.network_timeout_secs must be greater than zero"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    let url =
      Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("Invalid origin '{}': not a base URL", self.origin));
    }
    Ok(url)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
