//! Host bridge: the JSON-lines protocol spoken over stdin/stdout and the
//! host-side implementations of the collaborator traits.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::actions::{ActionEffect, ProductSummary, QuickAction, Toast};
use crate::cache::{CacheStats, EntryState, PopulateReport, ResourceRef};
use crate::install::{InstallChoice, InstallOffer, InstallOutcome};
use crate::notify::{ClientView, ClientViews, DisplayRequest, Navigation};
use crate::reachability::Banner;
use crate::sync::{PeriodicSyncHost, SyncReport};

/// Host feature support, detected once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
  pub cache_storage: bool,
  pub periodic_sync: bool,
  pub notifications: bool,
  pub install_prompt: bool,
  pub share: bool,
}

impl Default for Capabilities {
  fn default() -> Self {
    Self {
      cache_storage: true,
      periodic_sync: true,
      notifications: true,
      install_prompt: true,
      share: false,
    }
  }
}

/// Events written by the host, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum HostEvent {
  Online,
  Offline,
  /// A resource reference moved relative to the viewport
  ResourceVisible(ResourceRef),
  /// Current set of open client views
  Views { views: Vec<ClientView> },
  /// Host-driven wake for a periodic task
  PeriodicSync { tag: String },
  /// Push delivery; `payload` is the raw message text
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  NotificationClick {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Value,
  },
  NotificationClose { id: u64 },
  BeforeInstallPrompt { id: String },
  InstallPromptRequest,
  InstallChoice { id: String, choice: InstallChoice },
  AppInstalled,
  QuickAction(QuickAction),
  CacheQuery { url: String },
  Evict { namespace: String },
  Stats,
}

/// Commands written to the host, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum HostCommand {
  Banner { banner: Banner },
  ShowNotification(DisplayRequest),
  CloseNotification { id: u64 },
  FocusView { id: String },
  OpenView { url: String },
  Navigated(Navigation),
  RegisterPeriodicSync { name: String, min_interval_secs: u64 },
  SyncResult(SyncReport),
  InstallAvailable { available: bool },
  ShowInstallPrompt { id: String },
  InstallResult { outcome: InstallOutcome },
  ShowToast(Toast),
  DismissToast { id: u64 },
  QuickView { product: ProductSummary },
  Share { url: String },
  CopyLink { url: String },
  CacheState { url: String, state: EntryState },
  PreloadComplete(PopulateReport),
  Evicted { namespace: String, existed: bool },
  Stats(CacheStats),
}

impl From<ActionEffect> for HostCommand {
  fn from(effect: ActionEffect) -> Self {
    match effect {
      ActionEffect::QuickView { product } => HostCommand::QuickView { product },
      ActionEffect::Share { url } => HostCommand::Share { url },
      ActionEffect::CopyLink { url } => HostCommand::CopyLink { url },
    }
  }
}

/// Sending side of the host command stream.
#[derive(Clone)]
pub struct HostOutput {
  tx: mpsc::UnboundedSender<HostCommand>,
}

impl HostOutput {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<HostCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }

  pub fn send(&self, command: HostCommand) {
    if self.tx.send(command).is_err() {
      debug!("Host output closed, dropping command");
    }
  }
}

/// Serialize commands to `writer` until every sender is gone.
pub async fn write_commands<W>(mut rx: mpsc::UnboundedReceiver<HostCommand>, mut writer: W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  while let Some(command) = rx.recv().await {
    let mut line =
      serde_json::to_vec(&command).map_err(|e| eyre!("Failed to serialize command: {}", e))?;
    line.push(b'\n');
    writer
      .write_all(&line)
      .await
      .map_err(|e| eyre!("Failed to write to host: {}", e))?;
    writer
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush host output: {}", e))?;
  }
  Ok(())
}

/// Client views as last reported by the host.
#[derive(Clone)]
pub struct BridgeViews {
  views: Arc<Mutex<Vec<ClientView>>>,
  out: HostOutput,
}

impl BridgeViews {
  pub fn new(out: HostOutput) -> Self {
    Self {
      views: Arc::new(Mutex::new(Vec::new())),
      out,
    }
  }

  pub fn update(&self, views: Vec<ClientView>) {
    if let Ok(mut current) = self.views.lock() {
      *current = views;
    }
  }
}

impl ClientViews for BridgeViews {
  fn list(&self) -> BoxFuture<'_, Result<Vec<ClientView>>> {
    let views = self
      .views
      .lock()
      .map(|v| v.clone())
      .map_err(|e| eyre!("Lock poisoned: {}", e));
    async move { views }.boxed()
  }

  fn focus(&self, id: &str) -> BoxFuture<'_, Result<()>> {
    self.out.send(HostCommand::FocusView { id: id.to_string() });
    async { Ok(()) }.boxed()
  }

  fn open(&self, url: &str) -> BoxFuture<'_, Result<()>> {
    let url = url.to_string();
    if let Ok(mut views) = self.views.lock() {
      // Remember the new view until the host sends a fresh list
      views.push(ClientView {
        id: format!("pending:{}", url),
        url: url.clone(),
      });
    }
    self.out.send(HostCommand::OpenView { url });
    async { Ok(()) }.boxed()
  }
}

/// Install prompts waiting for the host to report the user's choice.
#[derive(Clone, Default)]
pub struct PendingChoices {
  waiting: Arc<Mutex<Waiting>>,
}

#[derive(Default)]
struct Waiting {
  senders: HashMap<String, oneshot::Sender<InstallChoice>>,
  /// Set once the host is gone; no new prompt may wait after this
  closed: bool,
}

impl PendingChoices {
  fn wait_for(&self, id: &str) -> Result<oneshot::Receiver<InstallChoice>> {
    let mut waiting = self
      .waiting
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if waiting.closed {
      return Err(eyre!("Host closed before prompt {} was shown", id));
    }
    let (tx, rx) = oneshot::channel();
    waiting.senders.insert(id.to_string(), tx);
    Ok(rx)
  }

  /// Deliver a choice. Returns false if nothing was waiting for `id`.
  pub fn resolve(&self, id: &str, choice: InstallChoice) -> bool {
    let sender = self
      .waiting
      .lock()
      .ok()
      .and_then(|mut w| w.senders.remove(id));
    match sender {
      Some(tx) => tx.send(choice).is_ok(),
      None => {
        warn!(offer = id, "Install choice for unknown prompt");
        false
      }
    }
  }

  /// Drop every waiting prompt and refuse new ones. Waiters see the prompt
  /// as abandoned. Returns how many were waiting.
  pub fn abandon_all(&self) -> usize {
    let mut waiting = match self.waiting.lock() {
      Ok(waiting) => waiting,
      Err(poisoned) => poisoned.into_inner(),
    };
    waiting.closed = true;
    let abandoned = waiting.senders.len();
    waiting.senders.clear();
    abandoned
  }
}

/// Install offer announced by the host through `before-install-prompt`.
pub struct BridgeOffer {
  id: String,
  out: HostOutput,
  pending: PendingChoices,
}

impl BridgeOffer {
  pub fn new(id: String, out: HostOutput, pending: PendingChoices) -> Self {
    Self { id, out, pending }
  }
}

impl InstallOffer for BridgeOffer {
  fn suppress_default(&mut self) {
    // The host holds its native prompt until told otherwise
    debug!(offer = %self.id, "Host prompt suppressed");
  }

  fn prompt(self: Box<Self>) -> BoxFuture<'static, Result<InstallChoice>> {
    let waiting = self.pending.wait_for(&self.id);
    if waiting.is_ok() {
      self.out.send(HostCommand::ShowInstallPrompt {
        id: self.id.clone(),
      });
    }
    async move {
      waiting?
        .await
        .map_err(|_| eyre!("Install prompt {} abandoned", self.id))
    }
    .boxed()
  }
}

/// Periodic sync driven by the host: registrations are forwarded as commands
/// and wakes come back as `periodic-sync` events.
pub struct HostPeriodicSync {
  out: HostOutput,
}

impl HostPeriodicSync {
  pub fn new(out: HostOutput) -> Self {
    Self { out }
  }
}

impl PeriodicSyncHost for HostPeriodicSync {
  fn register(&self, name: &str, min_interval: Duration) -> Result<()> {
    self.out.send(HostCommand::RegisterPeriodicSync {
      name: name.to_string(),
      min_interval_secs: min_interval.as_secs(),
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::install::InstallCoordinator;
  use serde_json::json;

  #[test]
  fn test_parse_host_events() {
    let parse = |s: &str| serde_json::from_str::<HostEvent>(s).unwrap();

    assert_eq!(parse(r#"{"type": "online"}"#), HostEvent::Online);
    assert_eq!(
      parse(r#"{"type": "resource-visible", "url": "/images/a.png", "distance": 12.5}"#),
      HostEvent::ResourceVisible(ResourceRef {
        url: "/images/a.png".to_string(),
        distance: 12.5
      })
    );
    assert_eq!(
      parse(r#"{"type": "push"}"#),
      HostEvent::Push { payload: None }
    );
    assert_eq!(
      parse(r#"{"type": "notification-click", "action": "track", "data": {"orderId": "X"}}"#),
      HostEvent::NotificationClick {
        id: None,
        action: Some("track".to_string()),
        data: json!({"orderId": "X"})
      }
    );
    assert_eq!(
      parse(r#"{"type": "quick-action", "action": "share", "product_id": "p1"}"#),
      HostEvent::QuickAction(QuickAction::Share {
        product_id: "p1".to_string()
      })
    );
    assert_eq!(
      parse(r#"{"type": "install-choice", "id": "o1", "choice": "accepted"}"#),
      HostEvent::InstallChoice {
        id: "o1".to_string(),
        choice: InstallChoice::Accepted
      }
    );
  }

  #[test]
  fn test_command_wire_format() {
    let line = serde_json::to_value(HostCommand::Banner {
      banner: Banner::BackOnline,
    })
    .unwrap();
    assert_eq!(line, json!({"type": "banner", "banner": "back-online"}));

    let line = serde_json::to_value(HostCommand::RegisterPeriodicSync {
      name: "cart-sync".to_string(),
      min_interval_secs: 86400,
    })
    .unwrap();
    assert_eq!(
      line,
      json!({"type": "register-periodic-sync", "name": "cart-sync", "min_interval_secs": 86400})
    );
  }

  #[tokio::test]
  async fn test_write_commands_emits_json_lines() {
    let (out, rx) = HostOutput::channel();
    out.send(HostCommand::DismissToast { id: 1 });
    out.send(HostCommand::OpenView {
      url: "https://shop.example.com/cart".to_string(),
    });
    drop(out);

    let mut buffer = Vec::new();
    write_commands(rx, &mut buffer).await.unwrap();

    let text = String::from_utf8(buffer).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], r#"{"type":"dismiss-toast","id":1}"#);
  }

  #[tokio::test]
  async fn test_bridge_views_track_opened_views() {
    let (out, mut rx) = HostOutput::channel();
    let views = BridgeViews::new(out);
    views.update(vec![ClientView {
      id: "1".to_string(),
      url: "https://shop.example.com/".to_string(),
    }]);

    views.open("https://shop.example.com/cart").await.unwrap();
    assert_eq!(views.list().await.unwrap().len(), 2);
    assert_eq!(
      rx.recv().await,
      Some(HostCommand::OpenView {
        url: "https://shop.example.com/cart".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_bridge_offer_round_trip_through_host() {
    let (out, mut rx) = HostOutput::channel();
    let pending = PendingChoices::default();
    let coordinator = InstallCoordinator::new();
    coordinator.capture_offer(Box::new(BridgeOffer::new(
      "o1".to_string(),
      out,
      pending.clone(),
    )));

    let prompt = tokio::spawn({
      let coordinator = coordinator.clone();
      async move { coordinator.prompt_user().await }
    });

    assert_eq!(
      rx.recv().await,
      Some(HostCommand::ShowInstallPrompt {
        id: "o1".to_string()
      })
    );
    assert!(pending.resolve("o1", InstallChoice::Accepted));
    assert_eq!(prompt.await.unwrap(), InstallOutcome::Accepted);
    assert!(!pending.resolve("o1", InstallChoice::Accepted));
  }

  #[tokio::test]
  async fn test_abandon_all_releases_waiting_prompts() {
    let (out, _rx) = HostOutput::channel();
    let pending = PendingChoices::default();
    let coordinator = InstallCoordinator::new();
    coordinator.capture_offer(Box::new(BridgeOffer::new(
      "o1".to_string(),
      out.clone(),
      pending.clone(),
    )));

    let prompt = tokio::spawn({
      let coordinator = coordinator.clone();
      async move { coordinator.prompt_user().await }
    });
    tokio::task::yield_now().await;

    assert_eq!(pending.abandon_all(), 1);
    assert_eq!(prompt.await.unwrap(), InstallOutcome::Dismissed);

    // A prompt starting after close does not wait either
    coordinator.capture_offer(Box::new(BridgeOffer::new("o2".to_string(), out, pending.clone())));
    assert_eq!(coordinator.prompt_user().await, InstallOutcome::Dismissed);
    assert!(!pending.resolve("o2", InstallChoice::Accepted));
  }
}
