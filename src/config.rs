use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GitHubConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub drain: DrainSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
  /// Base URL of the REST API (override for GitHub Enterprise)
  #[serde(default = "default_api_url")]
  pub api_url: String,
  /// Timeout for fetches on a request's critical path, in seconds
  #[serde(default = "default_foreground_timeout")]
  pub foreground_timeout_secs: u64,
  /// Timeout for background refresh fetches, in seconds. More generous
  /// since no caller is waiting.
  #[serde(default = "default_background_timeout")]
  pub background_timeout_secs: u64,
}

impl Default for GitHubConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      foreground_timeout_secs: default_foreground_timeout(),
      background_timeout_secs: default_background_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to pass every read straight through to the API, e.g. when
  /// debugging staleness issues
  #[serde(default = "default_cache_enabled")]
  pub enabled: bool,
  /// TTL for shared-namespace entries, in seconds. Short: the shared
  /// cache is an optimization, not a correctness guarantee.
  #[serde(default = "default_shared_ttl")]
  pub shared_ttl_secs: u64,
  /// Skip enqueuing a refresh when the shared entry was synced within
  /// this window by any user, in seconds
  #[serde(default = "default_shared_skip_window")]
  pub shared_skip_window_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: default_cache_enabled(),
      shared_ttl_secs: default_shared_ttl(),
      shared_skip_window_secs: default_shared_skip_window(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainSettings {
  /// Jobs claimed per drain round
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  /// Drain rounds per trigger
  #[serde(default = "default_max_rounds")]
  pub max_rounds: usize,
  /// Running jobs older than this are treated as abandoned, in seconds
  #[serde(default = "default_running_timeout")]
  pub running_timeout_secs: u64,
}

impl Default for DrainSettings {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
      max_rounds: default_max_rounds(),
      running_timeout_secs: default_running_timeout(),
    }
  }
}

fn default_api_url() -> String {
  "https://api.github.com/".to_string()
}

fn default_foreground_timeout() -> u64 {
  10
}

fn default_background_timeout() -> u64 {
  30
}

fn default_cache_enabled() -> bool {
  true
}

fn default_shared_ttl() -> u64 {
  600
}

fn default_shared_skip_window() -> u64 {
  120
}

fn default_batch_size() -> usize {
  4
}

fn default_max_rounds() -> usize {
  3
}

fn default_running_timeout() -> u64 {
  120
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hubsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hubsync/config.yaml
  ///
  /// Every setting has a default, so a missing file (when no explicit
  /// path was given) yields the default configuration.
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
    let local = PathBuf::from("hubsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hubsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the GitHub API token from environment variables, if set.
  ///
  /// Checks HUBSYNC_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  /// Unauthenticated requests work for public data at a stricter rate
  /// limit, so a missing token is not an error.
  pub fn api_token() -> Option<String> {
    std::env::var("HUBSYNC_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
