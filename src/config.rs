use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::ResolvePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Custom title printed by the CLI (defaults to the API host if not set)
  pub title: Option<String>,
  #[serde(default)]
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend root, e.g. "https://backoffice.example.com/api"
  pub base_url: String,
  /// Fixed client-side timeout applied to every request
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Route announced to the frontend when the session has expired
  #[serde(default = "default_login_route")]
  pub login_route: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Which response wins when two fetches for one key overlap
  #[serde(default)]
  pub resolve_policy: ResolvePolicy,
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_login_route() -> String {
  "/login".to_string()
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Read the config from `explicit`, or from the first existing entry of
  /// [`search_paths`]. An explicit path must exist.
  pub fn load(explicit: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit {
      if !path.is_file() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let candidates = search_paths(env_config_path(), dirs::config_dir());
    let found = candidates.iter().find(|p| p.is_file()).ok_or_else(|| {
      let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
      eyre!("No storedesk config found (tried {}); it needs at least api.base_url", tried.join(", "))
    })?;
    tracing::debug!(path = %found.display(), "loading config");
    Self::load_from_path(found)
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a YAML document into a validated config.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;

    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("api.base_url '{}' is not a valid URL: {}", config.api.base_url, e))?;

    Ok(config)
  }

  /// Title for CLI output; falls back to the API host.
  pub fn display_title(&self) -> String {
    if let Some(title) = &self.title {
      return title.clone();
    }
    url::Url::parse(&self.api.base_url)
      .ok()
      .and_then(|u| u.host_str().map(String::from))
      .unwrap_or_else(|| "storedesk".to_string())
  }

  /// Token supplied through the environment, if any.
  ///
  /// Takes precedence over the persisted session token.
  pub fn env_token() -> Option<String> {
    std::env::var("STOREDESK_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

fn env_config_path() -> Option<PathBuf> {
  std::env::var_os("STOREDESK_CONFIG")
    .filter(|v| !v.is_empty())
    .map(PathBuf::from)
}

/// Where `load` looks when no path is given, in order: `$STOREDESK_CONFIG`,
/// `./storedesk.yaml`, then `<config dir>/storedesk/config.yaml`.
pub fn search_paths(env_path: Option<PathBuf>, config_dir: Option<PathBuf>) -> Vec<PathBuf> {
  let mut paths: Vec<PathBuf> = env_path.into_iter().collect();
  paths.push(PathBuf::from("storedesk.yaml"));
  paths.extend(config_dir.map(|d| d.join("storedesk").join("config.yaml")));
  paths
}

/// Directory for persisted state (token, logs).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("storedesk"))
}
