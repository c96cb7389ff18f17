use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::host::HostEvent;

/// Identifies one subscription on an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving side of a subscription.
pub struct Subscription<T> {
  id: SubscriptionId,
  rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
  pub fn id(&self) -> SubscriptionId {
    self.id
  }

  /// Wait for the next event. Returns None once unsubscribed.
  pub async fn recv(&mut self) -> Option<T> {
    self.rx.recv().await
  }

  /// Take an already delivered event without waiting.
  #[cfg(test)]
  pub fn try_recv(&mut self) -> Option<T> {
    self.rx.try_recv().ok()
  }
}

/// A multi-listener event stream with explicit subscribe/unsubscribe.
///
/// Components that publish host-driven transitions own one of these instead of
/// relying on ambient listeners, so tests can attach and detach at will.
pub struct EventSource<T> {
  listeners: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<T>>>,
  next_id: AtomicU64,
}

impl<T: Clone> EventSource<T> {
  pub fn new() -> Self {
    Self {
      listeners: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn subscribe(&self) -> Subscription<T> {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let (tx, rx) = mpsc::unbounded_channel();
    if let Ok(mut listeners) = self.listeners.lock() {
      listeners.insert(id, tx);
    }
    Subscription { id, rx }
  }

  /// Detach a listener. Returns false if it was not subscribed.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self
      .listeners
      .lock()
      .map(|mut listeners| listeners.remove(&id).is_some())
      .unwrap_or(false)
  }

  /// Deliver an event to every listener, dropping listeners whose receiver is gone.
  /// Returns the number of listeners reached.
  pub fn emit(&self, event: T) -> usize {
    let Ok(mut listeners) = self.listeners.lock() else {
      return 0;
    };
    listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
    listeners.len()
  }

  #[cfg(test)]
  pub fn listener_count(&self) -> usize {
    self.listeners.lock().map(|l| l.len()).unwrap_or(0)
  }
}

impl<T: Clone> Default for EventSource<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Event written by the host on stdin
  Host(HostEvent),
  /// Periodic tick for notice/toast expiry
  Tick,
  /// Scheduled wake for a periodic sync task
  Wake(String),
  /// Host closed its end of the protocol
  HostClosed,
}

/// Event handler that produces events from host input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a handler reading host events from stdin with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    Self::with_reader(BufReader::new(tokio::io::stdin()), tick_rate)
  }

  /// Create a handler over any line-oriented reader
  pub fn with_reader<R>(reader: R, tick_rate: Duration) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Host input reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = reader.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<HostEvent>(&line) {
              Ok(event) => {
                if input_tx.send(Event::Host(event)).is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "Skipping malformed host event"),
            }
          }
          Ok(None) => {
            debug!("Host input closed");
            let _ = input_tx.send(Event::HostClosed);
            break;
          }
          Err(e) => {
            warn!(error = %e, "Failed to read host input");
            let _ = input_tx.send(Event::HostClosed);
            break;
          }
        }
      }
    });

    // Tick
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for tasks that feed results back into the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_emit_reaches_all_subscribers() {
    let source = EventSource::new();
    let mut a = source.subscribe();
    let mut b = source.subscribe();

    assert_eq!(source.emit(7u32), 2);
    assert_eq!(a.recv().await, Some(7));
    assert_eq!(b.recv().await, Some(7));
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_delivery() {
    let source = EventSource::new();
    let mut a = source.subscribe();
    let b = source.subscribe();

    assert!(source.unsubscribe(a.id()));
    assert!(!source.unsubscribe(a.id()));
    assert_eq!(source.emit(1u32), 1);
    // Sender was dropped on unsubscribe
    assert_eq!(a.recv().await, None);
    drop(b);
  }

  #[tokio::test]
  async fn test_dropped_subscription_is_pruned() {
    let source = EventSource::new();
    let sub = source.subscribe();
    drop(sub);
    assert_eq!(source.emit("x"), 0);
    assert_eq!(source.listener_count(), 0);
  }

  #[tokio::test]
  async fn test_reader_skips_malformed_lines() {
    let input = "{\"type\":\"online\"}\nnot json\n\n{\"type\":\"offline\"}\n";
    let mut handler = EventHandler::with_reader(BufReader::new(input.as_bytes()), Duration::from_secs(3600));

    let mut hosts = Vec::new();
    while let Some(event) = handler.next().await {
      match event {
        Event::Host(e) => hosts.push(e),
        Event::HostClosed => break,
        _ => {}
      }
    }
    assert_eq!(hosts, vec![HostEvent::Online, HostEvent::Offline]);
  }
}
