use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::host::Capabilities;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin that relative resource references and API paths resolve against
  pub origin: String,
  pub cache: CacheConfig,
  pub reachability: ReachabilityConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub toast: ToastConfig,
  /// Host feature support, detected once at startup
  pub capabilities: Capabilities,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      reachability: ReachabilityConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      toast: ToastConfig::default(),
      capabilities: Capabilities::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// SQLite database path (defaults to the XDG data directory)
  pub database: Option<PathBuf>,
  /// Distance in pixels from the viewport at which a resource becomes a
  /// population candidate
  pub proximity_px: f64,
  /// Namespace used when no rule matches a URL
  pub default_namespace: String,
  pub namespaces: Vec<NamespaceConfig>,
  /// Critical assets populated once at startup, in order
  pub preload: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      database: None,
      proximity_px: 50.0,
      default_namespace: "media".to_string(),
      namespaces: vec![
        NamespaceConfig {
          name: "media".to_string(),
          max_entries: 60,
          max_age_secs: 30 * 24 * 60 * 60,
          extensions: ["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
          path_prefixes: vec!["/images/".to_string(), "/icons/".to_string()],
        },
        NamespaceConfig {
          name: "api".to_string(),
          max_entries: 50,
          max_age_secs: 5 * 60,
          extensions: Vec::new(),
          path_prefixes: vec!["/api/".to_string()],
        },
      ],
      preload: vec![
        "/icons/icon-192x192.png".to_string(),
        "/icons/icon-512x512.png".to_string(),
        "/images/banner-hero.webp".to_string(),
      ],
    }
  }
}

/// One resource class and its eviction policy.
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
  pub name: String,
  pub max_entries: usize,
  pub max_age_secs: u64,
  /// File extensions (lowercase, no dot) routed to this namespace
  #[serde(default, deserialize_with = "deserialize_lowercase_vec")]
  pub extensions: Vec<String>,
  /// URL path prefixes routed to this namespace
  #[serde(default)]
  pub path_prefixes: Vec<String>,
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
  /// Connectivity assumed before the host reports anything
  pub initial_online: bool,
  pub debounce_ms: u64,
  /// How long the "back online" notice stays visible
  pub notice_secs: u64,
}

impl Default for ReachabilityConfig {
  fn default() -> Self {
    Self {
      initial_online: true,
      debounce_ms: 500,
      notice_secs: 4,
    }
  }
}

impl ReachabilityConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn notice_ttl(&self) -> Duration {
    Duration::from_secs(self.notice_secs)
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncDriver {
  /// In-process timers wake the tasks
  #[default]
  Internal,
  /// Registrations are forwarded to the host, which delivers the wakes
  Host,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub driver: SyncDriver,
  pub cart_interval_secs: u64,
  pub wishlist_interval_secs: u64,
  pub price_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      driver: SyncDriver::Internal,
      cart_interval_secs: 24 * 60 * 60,
      wishlist_interval_secs: 12 * 60 * 60,
      price_interval_secs: 6 * 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_icon: String,
  pub default_badge: String,
  pub fallback_title: String,
  pub fallback_body: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_icon: "/icons/icon-192x192.png".to_string(),
      default_badge: "/icons/badge-72x72.png".to_string(),
      fallback_title: "Storefront".to_string(),
      fallback_body: "You have a new update".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToastConfig {
  pub duration_secs: u64,
}

impl Default for ToastConfig {
  fn default() -> Self {
    Self { duration_secs: 3 }
  }
}

impl ToastConfig {
  pub fn duration(&self) -> Duration {
    Duration::from_secs(self.duration_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for the log file (defaults to the XDG data directory)
  pub directory: Option<PathBuf>,
  /// Filter used when RUST_LOG is not set
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      directory: None,
      filter: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-offline/config.yaml
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storefront-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parse and validate a YAML document.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if !self
      .cache
      .namespaces
      .iter()
      .any(|ns| ns.name == self.cache.default_namespace)
    {
      return Err(eyre!(
        "Default namespace '{}' is not declared under cache.namespaces",
        self.cache.default_namespace
      ));
    }

    let mut names: Vec<&str> = self.cache.namespaces.iter().map(|ns| ns.name.as_str()).collect();
    names.sort_unstable();
    if names.windows(2).any(|w| w[0] == w[1]) {
      return Err(eyre!("Duplicate namespace name in cache.namespaces"));
    }

    Ok(())
  }
}
