use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub service: ServiceConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub images: ImagesConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Base URL of the data service (e.g. "https://project.supabase.co")
  pub url: String,
  /// Database schema sent as Accept-Profile/Content-Profile (defaults to the service's)
  pub schema: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Store location (defaults to $XDG_DATA_HOME/shopsync/store.db)
  pub path: Option<PathBuf>,
  /// Byte limit for the persistent store; writes beyond it fail
  pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
  /// Whether the binary blob tier is available
  #[serde(default = "default_true")]
  pub blob_cache: bool,
  /// Blob directory (defaults to $XDG_DATA_HOME/shopsync/blobs)
  pub blob_dir: Option<PathBuf>,
  /// Byte limit for the blob tier; once full, images fall back to the encoded tier
  pub blob_max_bytes: Option<u64>,
}

impl Default for ImagesConfig {
  fn default() -> Self {
    Self {
      blob_cache: true,
      blob_dir: None,
      blob_max_bytes: None,
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// Seconds between reachability probes in watch mode
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval(),
    }
  }
}

fn default_probe_interval() -> u64 {
  15
}

/// Directory holding the store, blobs and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("shopsync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shopsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shopsync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shopsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shopsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shopsync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the data-service API key from environment variables.
  ///
  /// Checks SHOPSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SHOPSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set SHOPSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("store.db")),
    }
  }

  pub fn blob_dir(&self) -> Result<PathBuf> {
    match &self.images.blob_dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(data_dir()?.join("blobs")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("service:\n  url: https://shop.example.com\n").unwrap();

    assert_eq!(config.service.timeout_secs, 30);
    assert!(config.images.blob_cache);
    assert_eq!(config.connectivity.probe_interval_secs, 15);
    assert_eq!(config.storage.quota_bytes, None);
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
service:
  url: https://shop.example.com
  schema: storefront
  timeout_secs: 10
storage:
  path: /tmp/shop.db
  quota_bytes: 5242880
images:
  blob_cache: false
  blob_max_bytes: 1024
connectivity:
  probe_interval_secs: 5
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.service.schema.as_deref(), Some("storefront"));
    assert_eq!(config.storage.quota_bytes, Some(5_242_880));
    assert_eq!(config.store_path().unwrap(), PathBuf::from("/tmp/shop.db"));
    assert!(!config.images.blob_cache);
    assert_eq!(config.images.blob_max_bytes, Some(1024));
    assert_eq!(config.connectivity.probe_interval_secs, 5);
  }

  #[test]
  fn test_missing_service_is_an_error() {
    assert!(Config::parse("storage: {}\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/shopsync.yaml"))).is_err());
  }
}
