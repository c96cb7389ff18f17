//! Routing of resource URLs to cache namespaces.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::config::{CacheConfig, NamespaceConfig};

/// Ages beyond a century are treated as "never expires".
const MAX_AGE_CAP_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Eviction policy of one namespace.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
  pub name: String,
  pub max_entries: usize,
  pub max_age: Duration,
  extensions: Vec<String>,
  path_prefixes: Vec<String>,
}

impl NamespacePolicy {
  fn from_config(config: &NamespaceConfig) -> Self {
    Self {
      name: config.name.clone(),
      max_entries: config.max_entries,
      max_age: Duration::seconds(config.max_age_secs.min(MAX_AGE_CAP_SECS) as i64),
      extensions: config.extensions.clone(),
      path_prefixes: config.path_prefixes.clone(),
    }
  }

  fn matches(&self, path: &str) -> bool {
    if self.path_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return true;
    }
    let extension = path
      .rsplit('/')
      .next()
      .and_then(|file| file.rsplit_once('.'))
      .map(|(_, ext)| ext.to_lowercase());
    match extension {
      Some(ext) => self.extensions.iter().any(|e| *e == ext),
      None => false,
    }
  }
}

/// Normalizes resource references and decides their namespace.
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
  origin: Url,
  policies: Vec<NamespacePolicy>,
  default_index: usize,
}

impl NamespaceResolver {
  pub fn new(origin: &str, config: &CacheConfig) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    let policies: Vec<NamespacePolicy> = config
      .namespaces
      .iter()
      .map(NamespacePolicy::from_config)
      .collect();
    let default_index = policies
      .iter()
      .position(|p| p.name == config.default_namespace)
      .ok_or_else(|| eyre!("Unknown default namespace '{}'", config.default_namespace))?;

    Ok(Self {
      origin,
      policies,
      default_index,
    })
  }

  /// Absolute form of a resource reference, used as the cache key.
  /// References that cannot be resolved are kept verbatim.
  pub fn normalize(&self, reference: &str) -> String {
    match self.origin.join(reference) {
      Ok(mut url) => {
        url.set_fragment(None);
        url.to_string()
      }
      Err(_) => reference.to_string(),
    }
  }

  /// Policy for an already normalized key. Prefix rules win over extension
  /// rules only by declaration order: the first matching namespace is used.
  pub fn policy_for(&self, key: &str) -> &NamespacePolicy {
    let path = Url::parse(key)
      .map(|u| u.path().to_string())
      .unwrap_or_else(|_| key.to_string());

    self
      .policies
      .iter()
      .find(|p| p.matches(&path))
      .unwrap_or(&self.policies[self.default_index])
  }

  pub fn policy(&self, namespace: &str) -> Option<&NamespacePolicy> {
    self.policies.iter().find(|p| p.name == namespace)
  }

  pub fn policies(&self) -> &[NamespacePolicy] {
    &self.policies
  }
}
