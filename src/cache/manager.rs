//! Cache manager that decides when resources are fetched and stored.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::namespace::{NamespacePolicy, NamespaceResolver};
use super::store::CacheStore;
use super::types::{
  CacheStats, CachedResponse, EntryState, Fetcher, ObserveOutcome, PopulateOutcome,
  PopulateReport, ResourceRef,
};
use crate::host::Capabilities;

type InFlight = Shared<BoxFuture<'static, PopulateOutcome>>;

#[derive(Debug, Clone)]
struct Tracked {
  namespace: String,
  state: EntryState,
}

#[derive(Default)]
struct Bookkeeping {
  tracked: HashMap<String, Tracked>,
  /// One shared attempt per key while a fetch is running
  inflight: HashMap<String, InFlight>,
  /// Keys that crossed the proximity threshold
  triggered: HashSet<String>,
  /// Keys observed outside the threshold
  watched: HashSet<String>,
  /// Keys whose last attempt hit a network failure
  failed: HashSet<String>,
}

struct Inner {
  store: Arc<dyn CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  resolver: NamespaceResolver,
  proximity_px: f64,
  capabilities: Capabilities,
  book: Mutex<Bookkeeping>,
}

enum Begin {
  Done(PopulateOutcome),
  Pending(InFlight),
}

/// Resource cache manager.
///
/// The only writer of cache entries: everything reaches the store through
/// `populate` (and the trimming it triggers) or `evict`.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<Inner>,
}

impl CacheManager {
  pub fn new(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    resolver: NamespaceResolver,
    proximity_px: f64,
    capabilities: Capabilities,
  ) -> Result<Self> {
    for policy in resolver.policies() {
      store.open(&policy.name)?;
    }

    Ok(Self {
      inner: Arc::new(Inner {
        store,
        fetcher,
        resolver,
        proximity_px,
        capabilities,
        book: Mutex::new(Bookkeeping::default()),
      }),
    })
  }

  fn book(&self) -> Result<MutexGuard<'_, Bookkeeping>> {
    self
      .inner
      .book
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn is_stale(&self, entry: &CachedResponse, policy: &NamespacePolicy) -> bool {
    Utc::now() - entry.cached_at > policy.max_age
  }

  /// Whether the persisted copy of `key` exists but is past its max age.
  fn stored_copy_is_stale(&self, key: &str) -> bool {
    let policy = self.inner.resolver.policy_for(key);
    match self.inner.store.match_key(&policy.name, key) {
      Ok(Some(entry)) => self.is_stale(&entry, policy),
      Ok(None) => false,
      Err(e) => {
        warn!("Cache lookup failed for {}: {}", key, e);
        false
      }
    }
  }

  /// Register interest in a resource near the viewport.
  ///
  /// Population starts once the resource is within the proximity threshold.
  /// Later observations of a triggered or cached resource are ignored until
  /// its stored copy goes stale.
  pub fn observe(&self, resource: &ResourceRef) -> ObserveOutcome {
    let key = self.inner.resolver.normalize(&resource.url);

    {
      let Ok(mut book) = self.book() else {
        return ObserveOutcome::Ignored;
      };
      if book.inflight.contains_key(&key) {
        return ObserveOutcome::Ignored;
      }
      let cached = book
        .tracked
        .get(&key)
        .map(|t| t.state == EntryState::Cached)
        .unwrap_or(false);
      if (cached || book.triggered.contains(&key)) && !self.stored_copy_is_stale(&key) {
        return ObserveOutcome::Ignored;
      }
      if resource.distance > self.inner.proximity_px {
        book.watched.insert(key);
        return ObserveOutcome::Watching;
      }
      book.watched.remove(&key);
      book.triggered.insert(key.clone());
    }

    debug!(url = %key, "Resource near viewport, populating");
    let this = self.clone();
    tokio::spawn(async move {
      this.populate(&key).await;
    });
    ObserveOutcome::Scheduled
  }

  /// Fetch and store a resource unless a fresh copy is already persisted.
  ///
  /// Concurrent calls for the same key share a single fetch and all observe
  /// its outcome. The fetch runs to completion even if every caller goes away.
  pub async fn populate(&self, url: &str) -> PopulateOutcome {
    let key = self.inner.resolver.normalize(url);
    match self.begin(&key) {
      Begin::Done(outcome) => outcome,
      Begin::Pending(attempt) => attempt.await,
    }
  }

  fn begin(&self, key: &str) -> Begin {
    let policy = self.inner.resolver.policy_for(key).clone();
    let mut book = match self.book() {
      Ok(book) => book,
      Err(e) => {
        warn!("Cannot populate {}: {}", key, e);
        return Begin::Done(PopulateOutcome::Failed);
      }
    };

    if let Some(attempt) = book.inflight.get(key) {
      debug!(url = %key, "Joining in-flight population");
      return Begin::Pending(attempt.clone());
    }

    match self.inner.store.match_key(&policy.name, key) {
      Ok(Some(entry)) if !self.is_stale(&entry, &policy) => {
        book.tracked.insert(
          key.to_string(),
          Tracked {
            namespace: policy.name.clone(),
            state: EntryState::Cached,
          },
        );
        return Begin::Done(PopulateOutcome::AlreadyCached);
      }
      Ok(Some(_)) => debug!(url = %key, "Cached copy is stale, refreshing"),
      Ok(None) => {}
      Err(e) => warn!("Cache lookup failed for {}, fetching anyway: {}", key, e),
    }

    let this = self.clone();
    let task_key = key.to_string();
    let task_policy = policy.clone();
    let handle = tokio::spawn(async move { this.fetch_and_store(&task_policy, &task_key).await });
    let attempt: InFlight = async move {
      handle.await.unwrap_or_else(|e| {
        warn!("Population task aborted: {}", e);
        PopulateOutcome::Failed
      })
    }
    .boxed()
    .shared();

    book.inflight.insert(key.to_string(), attempt.clone());
    book.tracked.insert(
      key.to_string(),
      Tracked {
        namespace: policy.name,
        state: EntryState::Populating,
      },
    );

    Begin::Pending(attempt)
  }

  async fn fetch_and_store(&self, policy: &NamespacePolicy, key: &str) -> PopulateOutcome {
    let outcome = match self.inner.fetcher.fetch(key).await {
      Ok(response) if response.is_acceptable() => {
        let entry = CachedResponse::from_fetched(response);
        match self.inner.store.put(&policy.name, key, &entry) {
          Ok(()) => PopulateOutcome::Stored,
          Err(e) => {
            warn!("Failed to store {}: {}", key, e);
            PopulateOutcome::Failed
          }
        }
      }
      Ok(response) => {
        warn!(url = %key, status = response.status, "Not caching unacceptable response");
        PopulateOutcome::Rejected {
          status: response.status,
        }
      }
      Err(e) => {
        warn!("Failed to fetch {}: {}", key, e);
        PopulateOutcome::Failed
      }
    };

    let remaining = if outcome == PopulateOutcome::Stored {
      self.enforce_bounds(policy)
    } else {
      None
    };

    if let Ok(mut book) = self.book() {
      book.inflight.remove(key);

      if let Some(remaining) = &remaining {
        // Drop bookkeeping for entries the trim just removed
        let dropped: Vec<String> = book
          .tracked
          .iter()
          .filter(|(k, t)| {
            t.namespace == policy.name && t.state == EntryState::Cached && !remaining.contains(*k)
          })
          .map(|(k, _)| k.clone())
          .collect();
        for k in &dropped {
          book.tracked.remove(k);
          book.triggered.remove(k);
        }
      }

      let persisted = remaining
        .as_ref()
        .map(|r| r.contains(key))
        .unwrap_or(false);
      let state = if persisted {
        EntryState::Cached
      } else {
        EntryState::Absent
      };
      book.tracked.insert(
        key.to_string(),
        Tracked {
          namespace: policy.name.clone(),
          state,
        },
      );

      if outcome == PopulateOutcome::Failed {
        book.failed.insert(key.to_string());
      } else {
        book.failed.remove(key);
      }
    }

    outcome
  }

  /// Purge expired entries, then drop the oldest until within max entries.
  /// Returns the keys left in the namespace.
  fn enforce_bounds(&self, policy: &NamespacePolicy) -> Option<HashSet<String>> {
    let store = &self.inner.store;
    let cutoff = Utc::now() - policy.max_age;

    match store.purge_older_than(&policy.name, cutoff) {
      Ok(0) => {}
      Ok(n) => debug!(namespace = %policy.name, purged = n, "Purged expired entries"),
      Err(e) => warn!("Failed to purge {}: {}", policy.name, e),
    }

    let mut keys = match store.keys(&policy.name) {
      Ok(keys) => keys,
      Err(e) => {
        warn!("Failed to list {}: {}", policy.name, e);
        return None;
      }
    };

    if keys.len() > policy.max_entries {
      let excess = keys.len() - policy.max_entries;
      for key in keys.drain(..excess) {
        if let Err(e) = store.remove(&policy.name, &key) {
          warn!("Failed to trim {}: {}", key, e);
        }
      }
      debug!(namespace = %policy.name, trimmed = excess, "Trimmed namespace");
    }

    Some(keys.into_iter().collect())
  }

  /// Populate a fixed list in order. One failure does not stop the rest.
  pub async fn preload(&self, urls: &[String]) -> PopulateReport {
    let mut report = PopulateReport::default();
    for url in urls {
      tally(&mut report, self.populate(url).await);
    }
    info!(
      stored = report.stored,
      already_cached = report.already_cached,
      failed = report.failed,
      "Preload finished"
    );
    report
  }

  /// Retry every key whose last attempt failed on the network.
  pub async fn reconcile(&self) -> PopulateReport {
    let keys: Vec<String> = match self.book() {
      Ok(mut book) => book.failed.drain().collect(),
      Err(_) => Vec::new(),
    };

    let mut report = PopulateReport::default();
    if keys.is_empty() {
      return report;
    }

    info!(count = keys.len(), "Reconciling failed populations");
    let outcomes = join_all(keys.iter().map(|k| self.populate(k))).await;
    for outcome in outcomes {
      tally(&mut report, outcome);
    }
    report
  }

  /// Delete a namespace and forget everything tracked for it.
  pub fn evict(&self, namespace: &str) -> Result<bool> {
    let mut book = self.book()?;
    let existed = self.inner.store.delete(namespace)?;

    let resolver = &self.inner.resolver;
    book.tracked.retain(|_, t| t.namespace != namespace);
    book
      .triggered
      .retain(|k| resolver.policy_for(k).name != namespace);
    book
      .watched
      .retain(|k| resolver.policy_for(k).name != namespace);
    book
      .failed
      .retain(|k| resolver.policy_for(k).name != namespace);

    if resolver.policy(namespace).is_some() {
      self.inner.store.open(namespace)?;
    }

    info!(namespace, existed, "Evicted namespace");
    Ok(existed)
  }

  /// Current state of a key, consulting the store for anything not in flight.
  pub fn state(&self, url: &str) -> EntryState {
    let key = self.inner.resolver.normalize(url);
    let policy = self.inner.resolver.policy_for(&key);

    if let Ok(book) = self.book() {
      if book.inflight.contains_key(&key) {
        return EntryState::Populating;
      }
    }

    match self.inner.store.match_key(&policy.name, &key) {
      Ok(Some(entry)) if self.is_stale(&entry, policy) => EntryState::Stale,
      Ok(Some(_)) => EntryState::Cached,
      Ok(None) => EntryState::Absent,
      Err(e) => {
        warn!("Cache lookup failed for {}: {}", key, e);
        EntryState::Absent
      }
    }
  }

  pub fn stats(&self) -> CacheStats {
    let cached_entries = self
      .inner
      .resolver
      .policies()
      .iter()
      .map(|p| match self.inner.store.keys(&p.name) {
        Ok(keys) => keys.len(),
        Err(e) => {
          warn!("Failed to count {}: {}", p.name, e);
          0
        }
      })
      .sum();

    let tracked_keys = self.book().map(|b| b.tracked.len()).unwrap_or(0);

    CacheStats {
      cached_entries,
      tracked_keys,
      capabilities: self.inner.capabilities.clone(),
    }
  }
}

fn tally(report: &mut PopulateReport, outcome: PopulateOutcome) {
  match outcome {
    PopulateOutcome::Stored => report.stored += 1,
    PopulateOutcome::AlreadyCached => report.already_cached += 1,
    PopulateOutcome::Rejected { .. } | PopulateOutcome::Failed => report.failed += 1,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::{NoopStore, SqliteStore};
  use crate::cache::types::FetchedResponse;
  use crate::config::CacheConfig;
  use std::collections::BTreeMap;
  use std::time::Duration;

  const ORIGIN: &str = "https://shop.example.com";

  #[derive(Default)]
  struct FakeFetcher {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    status: Mutex<HashMap<String, u16>>,
  }

  impl FakeFetcher {
    fn calls(&self) -> usize {
      self.calls.lock().unwrap().len()
    }

    fn fail(&self, url: &str) {
      self.failing.lock().unwrap().insert(url.to_string());
    }

    fn heal(&self) {
      self.failing.lock().unwrap().clear();
    }

    fn respond_with(&self, url: &str, status: u16) {
      self.status.lock().unwrap().insert(url.to_string(), status);
    }
  }

  impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchedResponse>> {
      self.calls.lock().unwrap().push(url.to_string());
      let failing = self.failing.lock().unwrap().contains(url);
      let status = self.status.lock().unwrap().get(url).copied().unwrap_or(200);
      let body = url.as_bytes().to_vec();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if failing {
          return Err(eyre!("connection refused"));
        }
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "image/png".to_string());
        Ok(FetchedResponse {
          status,
          headers,
          body,
        })
      }
      .boxed()
    }
  }

  fn manager_with(
    store: Arc<dyn CacheStore>,
    config: &CacheConfig,
  ) -> (CacheManager, Arc<FakeFetcher>) {
    let fetcher = Arc::new(FakeFetcher::default());
    let resolver = NamespaceResolver::new(ORIGIN, config).unwrap();
    let manager = CacheManager::new(
      store,
      fetcher.clone(),
      resolver,
      config.proximity_px,
      Capabilities::default(),
    )
    .unwrap();
    (manager, fetcher)
  }

  fn manager() -> (CacheManager, Arc<FakeFetcher>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let (manager, fetcher) = manager_with(store.clone(), &CacheConfig::default());
    (manager, fetcher, store)
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_populate_fetches_once() {
    let (manager, fetcher, _) = manager();

    let (a, b) = tokio::join!(
      manager.populate("/images/a.png"),
      manager.populate("/images/a.png")
    );

    assert_eq!(a, PopulateOutcome::Stored);
    assert_eq!(b, PopulateOutcome::Stored);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(manager.state("/images/a.png"), EntryState::Cached);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_key_is_not_fetched_again() {
    let (manager, fetcher, _) = manager();

    assert_eq!(manager.populate("/images/a.png").await, PopulateOutcome::Stored);
    assert_eq!(
      manager.populate(&url("/images/a.png")).await,
      PopulateOutcome::AlreadyCached
    );
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_check_uses_persistent_store() {
    let (manager, fetcher, store) = manager();
    let entry = CachedResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: b"seeded".to_vec(),
      cached_at: Utc::now(),
    };
    store.put("media", &url("/images/seeded.png"), &entry).unwrap();

    assert_eq!(
      manager.populate("/images/seeded.png").await,
      PopulateOutcome::AlreadyCached
    );
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_refreshed() {
    let (manager, fetcher, store) = manager();
    let old = CachedResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: b"old".to_vec(),
      cached_at: Utc::now() - chrono::Duration::days(2),
    };
    store.put("api", &url("/api/products"), &old).unwrap();
    assert_eq!(manager.state("/api/products"), EntryState::Stale);

    assert_eq!(manager.populate("/api/products").await, PopulateOutcome::Stored);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(manager.state("/api/products"), EntryState::Cached);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_returns_to_absent_without_retry() {
    let (manager, fetcher, _) = manager();
    fetcher.fail(&url("/images/a.png"));

    assert_eq!(manager.populate("/images/a.png").await, PopulateOutcome::Failed);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(manager.state("/images/a.png"), EntryState::Absent);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unacceptable_status_is_not_stored() {
    let (manager, fetcher, _) = manager();
    fetcher.respond_with(&url("/images/missing.png"), 404);

    assert_eq!(
      manager.populate("/images/missing.png").await,
      PopulateOutcome::Rejected { status: 404 }
    );
    assert_eq!(manager.state("/images/missing.png"), EntryState::Absent);
    assert_eq!(manager.stats().cached_entries, 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconcile_retries_network_failures_only() {
    let (manager, fetcher, _) = manager();
    fetcher.fail(&url("/images/a.png"));
    fetcher.respond_with(&url("/images/gone.png"), 410);

    manager.populate("/images/a.png").await;
    manager.populate("/images/gone.png").await;
    fetcher.heal();

    let report = manager.reconcile().await;
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(fetcher.calls(), 3);

    // Nothing left to reconcile
    assert_eq!(manager.reconcile().await, PopulateReport::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_evict_forces_refetch() {
    let (manager, fetcher, _) = manager();
    manager.populate("/images/a.png").await;
    manager.populate("/images/b.png").await;
    manager.populate("/api/cart").await;

    assert!(manager.evict("media").unwrap());
    assert_eq!(manager.stats().cached_entries, 1);

    assert_eq!(manager.populate("/images/a.png").await, PopulateOutcome::Stored);
    assert_eq!(manager.populate("/api/cart").await, PopulateOutcome::AlreadyCached);
    assert_eq!(fetcher.calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_namespace_is_trimmed_to_max_entries() {
    let mut config = CacheConfig::default();
    config.namespaces[0].max_entries = 2;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let (manager, _fetcher) = manager_with(store.clone(), &config);

    for path in ["/images/a.png", "/images/b.png", "/images/c.png"] {
      assert_eq!(manager.populate(path).await, PopulateOutcome::Stored);
    }

    assert_eq!(
      store.keys("media").unwrap(),
      vec![url("/images/b.png"), url("/images/c.png")]
    );
    assert_eq!(manager.state("/images/a.png"), EntryState::Absent);
    assert_eq!(manager.stats().tracked_keys, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_observe_respects_proximity_and_is_idempotent() {
    let (manager, fetcher, _) = manager();
    let far = ResourceRef {
      url: "/images/a.png".to_string(),
      distance: 800.0,
    };
    let near = ResourceRef {
      url: "/images/a.png".to_string(),
      distance: 20.0,
    };

    assert_eq!(manager.observe(&far), ObserveOutcome::Watching);
    assert_eq!(manager.observe(&far), ObserveOutcome::Watching);
    assert_eq!(fetcher.calls(), 0);

    assert_eq!(manager.observe(&near), ObserveOutcome::Scheduled);
    assert_eq!(manager.observe(&near), ObserveOutcome::Ignored);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(manager.state("/images/a.png"), EntryState::Cached);
    assert_eq!(manager.observe(&near), ObserveOutcome::Ignored);
  }

  #[tokio::test(start_paused = true)]
  async fn test_observe_refreshes_stale_copy() {
    let (manager, fetcher, store) = manager();
    let near = ResourceRef {
      url: "/api/products".to_string(),
      distance: 0.0,
    };

    assert_eq!(manager.observe(&near), ObserveOutcome::Scheduled);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.observe(&near), ObserveOutcome::Ignored);

    let old = CachedResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: b"old".to_vec(),
      cached_at: Utc::now() - chrono::Duration::days(2),
    };
    store.put("api", &url("/api/products"), &old).unwrap();

    assert_eq!(manager.observe(&near), ObserveOutcome::Scheduled);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(manager.state("/api/products"), EntryState::Cached);
  }

  #[tokio::test(start_paused = true)]
  async fn test_preload_continues_after_failure() {
    let (manager, fetcher, _) = manager();
    fetcher.fail(&url("/icons/broken.png"));
    let urls = vec![
      "/icons/icon-192x192.png".to_string(),
      "/icons/broken.png".to_string(),
      "/images/banner.webp".to_string(),
    ];

    let report = manager.preload(&urls).await;
    assert_eq!(report.stored, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(fetcher.calls(), 3);

    let again = manager.preload(&urls).await;
    assert_eq!(again.already_cached, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stats_counts_entries_and_tracked_keys() {
    let (manager, _fetcher, _) = manager();
    manager.populate("/images/a.png").await;
    manager.populate("/api/products").await;

    let stats = manager.stats();
    assert_eq!(stats.cached_entries, 2);
    assert_eq!(stats.tracked_keys, 2);
    assert_eq!(stats.capabilities, Capabilities::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_noop_store_never_reports_cached() {
    let (manager, fetcher) = manager_with(Arc::new(NoopStore), &CacheConfig::default());

    assert_eq!(manager.populate("/images/a.png").await, PopulateOutcome::Stored);
    assert_eq!(manager.populate("/images/a.png").await, PopulateOutcome::Stored);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(manager.state("/images/a.png"), EntryState::Absent);
  }
}
