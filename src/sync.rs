//! Background sync scheduling.
//!
//! Tasks are registered with the host by name and a minimum interval; the
//! host decides when to wake them. Each wake dispatches to one handler, and a
//! failing handler never affects its siblings or its own registration.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

pub const CART_SYNC: &str = "cart-sync";
pub const PRICE_REFRESH: &str = "price-refresh";
pub const WISHLIST_SYNC: &str = "wishlist-sync";

/// A domain sync routine invoked on each wake.
pub trait SyncHandler: Send + Sync {
  fn run(&self) -> BoxFuture<'static, Result<()>>;
}

/// Host-side periodic wake registration.
///
/// Registering a name that is already registered replaces its interval.
pub trait PeriodicSyncHost: Send + Sync {
  fn register(&self, name: &str, min_interval: Duration) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum SyncStatus {
  Succeeded,
  Failed { error: String },
  /// No handler for the woken name
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub task: String,
  #[serde(flatten)]
  pub status: SyncStatus,
}

/// A registered periodic task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
  pub name: String,
  pub min_interval: Duration,
  pub last_run: Option<DateTime<Utc>>,
  pub last_status: Option<SyncStatus>,
}

struct Inner {
  host: Option<Arc<dyn PeriodicSyncHost>>,
  handlers: HashMap<String, Arc<dyn SyncHandler>>,
  tasks: Mutex<BTreeMap<String, SyncTask>>,
}

#[derive(Clone)]
pub struct SyncScheduler {
  inner: Arc<Inner>,
}

impl SyncScheduler {
  /// `host` is None when the periodic-sync capability is absent; every
  /// registration is then a no-op.
  pub fn new(
    host: Option<Arc<dyn PeriodicSyncHost>>,
    handlers: HashMap<String, Arc<dyn SyncHandler>>,
  ) -> Self {
    if host.is_none() {
      info!("Periodic sync unavailable, background sync runs on reconnect only");
    }
    Self {
      inner: Arc::new(Inner {
        host,
        handlers,
        tasks: Mutex::new(BTreeMap::new()),
      }),
    }
  }

  /// Ask the host to wake `name` no more often than `min_interval`.
  /// Returns false when periodic sync is unavailable.
  pub fn register_periodic(&self, name: &str, min_interval: Duration) -> Result<bool> {
    let Some(host) = &self.inner.host else {
      debug!(task = name, "Skipping periodic registration");
      return Ok(false);
    };

    host
      .register(name, min_interval)
      .map_err(|e| eyre!("Failed to register periodic sync {}: {}", name, e))?;

    let mut tasks = self
      .inner
      .tasks
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    tasks
      .entry(name.to_string())
      .and_modify(|t| t.min_interval = min_interval)
      .or_insert_with(|| SyncTask {
        name: name.to_string(),
        min_interval,
        last_run: None,
        last_status: None,
      });

    info!(task = name, interval_secs = min_interval.as_secs(), "Registered periodic sync");
    Ok(true)
  }

  /// Register the fixed startup set. Prices go stale fastest, then the
  /// wishlist, then the cart.
  pub fn register_defaults(&self, config: &SyncConfig) {
    let defaults = [
      (CART_SYNC, config.cart_interval_secs),
      (PRICE_REFRESH, config.price_interval_secs),
      (WISHLIST_SYNC, config.wishlist_interval_secs),
    ];
    for (name, secs) in defaults {
      if let Err(e) = self.register_periodic(name, Duration::from_secs(secs)) {
        warn!("{}", e);
      }
    }
  }

  /// Dispatch a host wake to its handler.
  pub async fn on_wake(&self, name: &str) -> SyncReport {
    let Some(handler) = self.inner.handlers.get(name).cloned() else {
      warn!(task = name, "Wake for unknown sync task");
      return SyncReport {
        task: name.to_string(),
        status: SyncStatus::Unknown,
      };
    };

    debug!(task = name, "Running sync task");
    let status = match handler.run().await {
      Ok(()) => {
        info!(task = name, "Sync succeeded");
        SyncStatus::Succeeded
      }
      Err(e) => {
        // The next wake retries
        warn!(task = name, "Sync failed: {}", e);
        SyncStatus::Failed {
          error: e.to_string(),
        }
      }
    };

    if let Ok(mut tasks) = self.inner.tasks.lock() {
      if let Some(task) = tasks.get_mut(name) {
        task.last_run = Some(Utc::now());
        task.last_status = Some(status.clone());
      }
    }

    SyncReport {
      task: name.to_string(),
      status,
    }
  }

  /// Run every handler once, concurrently. Used after reconnecting.
  pub async fn run_all(&self) -> Vec<SyncReport> {
    let mut names: Vec<&String> = self.inner.handlers.keys().collect();
    names.sort();
    join_all(names.into_iter().map(|name| self.on_wake(name))).await
  }

  /// Snapshot of registered tasks, ordered by name.
  pub fn tasks(&self) -> Vec<SyncTask> {
    self
      .inner
      .tasks
      .lock()
      .map(|tasks| tasks.values().cloned().collect())
      .unwrap_or_default()
  }

  pub fn is_available(&self) -> bool {
    self.inner.host.is_some()
  }
}

type WakeFn = Arc<dyn Fn(&str) + Send + Sync>;

/// In-process periodic driver: one tokio timer per task name.
///
/// Re-registering a name aborts its previous timer, so a name never has two
/// schedules.
pub struct IntervalSyncHost {
  on_wake: WakeFn,
  timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl IntervalSyncHost {
  pub fn new<F>(on_wake: F) -> Self
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    Self {
      on_wake: Arc::new(on_wake),
      timers: Mutex::new(HashMap::new()),
    }
  }
}

impl PeriodicSyncHost for IntervalSyncHost {
  fn register(&self, name: &str, min_interval: Duration) -> Result<()> {
    if min_interval.is_zero() {
      return Err(eyre!("Interval for {} must be positive", name));
    }

    let on_wake = Arc::clone(&self.on_wake);
    let task_name = name.to_string();
    let handle = tokio::spawn(async move {
      let mut interval = interval_at(Instant::now() + min_interval, min_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        on_wake(&task_name);
      }
    });

    let mut timers = self
      .timers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(previous) = timers.insert(name.to_string(), handle) {
      previous.abort();
    }
    Ok(())
  }
}

impl Drop for IntervalSyncHost {
  fn drop(&mut self) {
    if let Ok(timers) = self.timers.lock() {
      for handle in timers.values() {
        handle.abort();
      }
    }
  }
}
