use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the acting user; overrides `user`.
pub const USER_ENV: &str = "ISSUEDECK_USER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite database backing the tracker (defaults to the data directory)
  pub backend: Option<PathBuf>,
  /// Id of the signed-in user
  pub user: Option<String>,
  /// Log filter used when ISSUEDECK_LOG is unset, e.g. "issuedeck=debug"
  pub log_level: Option<String>,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Refresh affected views after a failed write, once the snapshot has
  /// been restored
  pub reconcile_on_error: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./issuedeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/issuedeck/config.yaml
  ///
  /// Without a config file the defaults are used. `ISSUEDECK_USER`
  /// overrides the configured user.
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
      None => Config::default(),
    };
    if let Ok(user) = std::env::var(USER_ENV) {
      config.user = Some(user).filter(|u| !u.trim().is_empty());
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("issuedeck.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("issuedeck").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is a valid, default configuration
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Database path: the configured one or the default in the data directory.
  pub fn backend_path(&self) -> Result<PathBuf> {
    self
      .backend
      .clone()
      .or_else(crate::backend::SqliteBackend::default_path)
      .ok_or_else(|| eyre!("Could not determine a data directory; set `backend` in the config"))
  }
}
