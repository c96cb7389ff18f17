//! Core types for the resource cache.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;

use color_eyre::Result;

use crate::host::Capabilities;

/// A stored response: status, content headers and the opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// When the response was written to the cache
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn from_fetched(fetched: FetchedResponse) -> Self {
    Self {
      status: fetched.status,
      headers: fetched.headers,
      body: fetched.body,
      cached_at: Utc::now(),
    }
  }
}

/// Raw network response as returned by a [`Fetcher`].
#[derive(Debug, Clone, Default)]
pub struct FetchedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl FetchedResponse {
  /// Only successful responses are worth keeping.
  pub fn is_acceptable(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Network access used to populate the cache.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchedResponse>>;
}

/// Lifecycle of one cache key as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
  Absent,
  Populating,
  Cached,
  /// Present in the store but older than the namespace max age
  Stale,
}

/// Result of a single population attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum PopulateOutcome {
  /// Already in the store and fresh; nothing fetched
  AlreadyCached,
  /// Fetched and stored
  Stored,
  /// Fetched, but the status was not acceptable
  Rejected { status: u16 },
  /// Network failure
  Failed,
}

/// What an `observe` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
  /// Outside the proximity threshold; watched only
  Watching,
  /// Became a candidate and population was started
  Scheduled,
  /// Already triggered, populating or cached
  Ignored,
}

/// A resource reference reported by the UI layer.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ResourceRef {
  pub url: String,
  /// Distance in pixels between the resource and the visible viewport;
  /// zero or negative means it intersects the viewport
  #[serde(default)]
  pub distance: f64,
}

/// Summary of a batch of population attempts (preload, reconcile).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
  pub stored: usize,
  pub already_cached: usize,
  pub failed: usize,
}

/// Read-only snapshot of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  /// Entries persisted across all namespaces
  pub cached_entries: usize,
  /// Keys tracked in memory
  pub tracked_keys: usize,
  pub capabilities: Capabilities,
}
