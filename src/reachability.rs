//! Host-reported connectivity with debouncing and a self-expiring reconnect notice.
//!
//! The monitor never probes the network itself. If the host's signal is wrong,
//! so is the monitor.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReachabilityConfig;
use crate::event::{EventSource, Subscription, SubscriptionId};

/// Settled connectivity transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
  WentOnline,
  WentOffline,
}

/// What the UI should show about connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Banner {
  /// Shown for as long as the client is offline
  Offline,
  /// Shown briefly after reconnecting
  BackOnline,
  Hidden,
}

#[derive(Debug)]
struct State {
  online: bool,
  pending: Option<bool>,
  generation: u64,
  reconnected_at: Option<Instant>,
}

struct Inner {
  state: Mutex<State>,
  events: EventSource<ReachabilityEvent>,
  debounce: Duration,
  notice_ttl: Duration,
}

#[derive(Clone)]
pub struct ReachabilityMonitor {
  inner: Arc<Inner>,
}

impl ReachabilityMonitor {
  pub fn new(config: &ReachabilityConfig) -> Self {
    Self::with_timing(config.initial_online, config.debounce(), config.notice_ttl())
  }

  pub fn with_timing(initial_online: bool, debounce: Duration, notice_ttl: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          online: initial_online,
          pending: None,
          generation: 0,
          reconnected_at: None,
        }),
        events: EventSource::new(),
        debounce,
        notice_ttl,
      }),
    }
  }

  pub fn subscribe(&self) -> Subscription<ReachabilityEvent> {
    self.inner.events.subscribe()
  }

  /// Detach a listener obtained from `subscribe`.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self.inner.events.unsubscribe(id)
  }

  #[cfg(test)]
  pub fn listener_count(&self) -> usize {
    self.inner.events.listener_count()
  }

  /// Announce the initial state. An offline start is emitted right away so
  /// dependents do not wait for a transition that may never come.
  pub fn start(&self) {
    if !self.is_online() {
      info!("Starting offline");
      self.inner.events.emit(ReachabilityEvent::WentOffline);
    }
  }

  /// Current settled reachability
  pub fn is_online(&self) -> bool {
    self.with_state(|s| s.online).unwrap_or(true)
  }

  /// Record a host connectivity report. Reports inside the debounce window
  /// collapse into the last one.
  pub fn report(&self, online: bool) {
    let Some(generation) = self.with_state(|s| {
      s.generation += 1;
      s.pending = Some(online);
      s.generation
    }) else {
      return;
    };

    if self.inner.debounce.is_zero() {
      self.settle(generation);
      return;
    }

    let this = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(this.inner.debounce).await;
      this.settle(generation);
    });
  }

  fn settle(&self, generation: u64) {
    let event = self
      .with_state(|s| {
        if s.generation != generation {
          // A newer report superseded this one
          return None;
        }
        let pending = s.pending.take()?;
        if pending == s.online {
          return None;
        }
        s.online = pending;
        if pending {
          s.reconnected_at = Some(Instant::now());
          Some(ReachabilityEvent::WentOnline)
        } else {
          s.reconnected_at = None;
          Some(ReachabilityEvent::WentOffline)
        }
      })
      .flatten();

    if let Some(event) = event {
      match event {
        ReachabilityEvent::WentOnline => info!("Back online"),
        ReachabilityEvent::WentOffline => warn!("Gone offline"),
      }
      let delivered = self.inner.events.emit(event);
      debug!(?event, delivered, "Reachability transition emitted");
    }
  }

  /// Whether the reconnect notice is still live. Expires on its own; the
  /// online state does not.
  pub fn reconnect_notice_active(&self) -> bool {
    self
      .with_state(|s| {
        s.online
          && s
            .reconnected_at
            .map(|t| t.elapsed() < self.inner.notice_ttl)
            .unwrap_or(false)
      })
      .unwrap_or(false)
  }

  pub fn banner(&self) -> Banner {
    if !self.is_online() {
      Banner::Offline
    } else if self.reconnect_notice_active() {
      Banner::BackOnline
    } else {
      Banner::Hidden
    }
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
    match self.inner.state.lock() {
      Ok(mut state) => Some(f(&mut state)),
      Err(e) => {
        warn!("Reachability state lock poisoned: {}", e);
        None
      }
    }
  }
}
