//! Push notification rendering and click routing.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;

/// Notifications tracked at once; the oldest are forgotten past this
const MAX_TRACKED: usize = 64;

/// Payload delivered by the push service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
  pub title: String,
  #[serde(default)]
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  #[serde(default)]
  pub data: Value,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub require_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// What the host is asked to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRequest {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  pub data: Value,
  pub actions: Vec<NotificationAction>,
  pub require_interaction: bool,
  /// Set when the payload was missing or unreadable
  pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
  Delivered,
  Displayed,
  DismissedByUser,
  ActedOn,
}

/// Result of displaying a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Display {
  pub request: DisplayRequest,
  /// Notification with the same tag that this one replaced
  pub replaced: Option<u64>,
}

/// An open client view (tab/window) of the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientView {
  pub id: String,
  pub url: String,
}

/// Host API for enumerating and activating client views.
pub trait ClientViews: Send + Sync {
  fn list(&self) -> BoxFuture<'_, Result<Vec<ClientView>>>;
  fn focus(&self, id: &str) -> BoxFuture<'_, Result<()>>;
  fn open(&self, url: &str) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum NavigationOutcome {
  /// An open view already showed the destination
  Focused { view_id: String },
  Opened,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Navigation {
  /// Destination path from the action table
  pub destination: String,
  /// Destination resolved against the origin
  pub url: String,
  #[serde(flatten)]
  pub outcome: NavigationOutcome,
}

/// Map a notification action and its data to a destination path.
pub fn destination_for(action: Option<&str>, data: &Value) -> String {
  let order_id = data.get("orderId").and_then(|v| match v {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  });

  match action {
    Some("view") | Some("view-order") => match order_id {
      Some(id) => format!("/orders/{}", id),
      None => "/orders".to_string(),
    },
    Some("track") => match order_id {
      Some(id) => format!("/orders/{}/track", id),
      None => "/orders".to_string(),
    },
    Some("shop") => "/products".to_string(),
    Some("view-cart") => "/cart".to_string(),
    Some("checkout") => "/checkout".to_string(),
    _ => data
      .get("url")
      .and_then(Value::as_str)
      .filter(|s| !s.is_empty())
      .unwrap_or("/")
      .to_string(),
  }
}

struct Shown {
  request: DisplayRequest,
  state: NotificationState,
}

#[derive(Default)]
struct Displayed {
  next_id: u64,
  active: Vec<Shown>,
}

struct Inner {
  origin: Url,
  defaults: NotificationConfig,
  views: Arc<dyn ClientViews>,
  displayed: Mutex<Displayed>,
}

#[derive(Clone)]
pub struct NotificationRouter {
  inner: Arc<Inner>,
}

impl NotificationRouter {
  pub fn new(origin: &str, defaults: NotificationConfig, views: Arc<dyn ClientViews>) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    Ok(Self {
      inner: Arc::new(Inner {
        origin,
        defaults,
        views,
        displayed: Mutex::new(Displayed::default()),
      }),
    })
  }

  /// Render a delivery. Missing or unreadable payloads still produce exactly
  /// one generic notification.
  pub fn display(&self, raw: Option<&str>) -> Display {
    let payload = match raw {
      Some(raw) => match serde_json::from_str::<NotificationPayload>(raw) {
        Ok(payload) => Some(payload),
        Err(e) => {
          warn!("Unreadable push payload, showing fallback: {}", e);
          None
        }
      },
      None => {
        warn!("Push delivered without payload, showing fallback");
        None
      }
    };

    let defaults = &self.inner.defaults;
    let mut displayed = match self.inner.displayed.lock() {
      Ok(d) => d,
      Err(poisoned) => poisoned.into_inner(),
    };
    displayed.next_id += 1;
    let id = displayed.next_id;

    let request = match payload {
      Some(p) => DisplayRequest {
        id,
        title: if p.title.trim().is_empty() {
          defaults.fallback_title.clone()
        } else {
          p.title
        },
        body: p.body,
        icon: p.icon.unwrap_or_else(|| defaults.default_icon.clone()),
        badge: p.badge.unwrap_or_else(|| defaults.default_badge.clone()),
        tag: p.tag,
        data: p.data,
        actions: p.actions,
        require_interaction: p.require_interaction,
        fallback: false,
      },
      None => DisplayRequest {
        id,
        title: defaults.fallback_title.clone(),
        body: defaults.fallback_body.clone(),
        icon: defaults.default_icon.clone(),
        badge: defaults.default_badge.clone(),
        tag: None,
        data: serde_json::json!({ "url": "/" }),
        actions: Vec::new(),
        require_interaction: false,
        fallback: true,
      },
    };

    let mut shown = Shown {
      request: request.clone(),
      state: NotificationState::Delivered,
    };

    let replaced = match &request.tag {
      Some(tag) => {
        let position = displayed
          .active
          .iter()
          .position(|s| s.request.tag.as_deref() == Some(tag.as_str()));
        position.map(|i| displayed.active.remove(i).request.id)
      }
      None => None,
    };

    shown.state = NotificationState::Displayed;
    displayed.active.push(shown);
    if displayed.active.len() > MAX_TRACKED {
      let excess = displayed.active.len() - MAX_TRACKED;
      displayed.active.drain(..excess);
      debug!(forgotten = excess, "Stopped tracking oldest notifications");
    }

    debug!(id, tag = ?request.tag, replaced = ?replaced, "Notification displayed");
    Display { request, replaced }
  }

  /// State of a notification that is still on screen.
  #[cfg(test)]
  pub fn state(&self, id: u64) -> Option<NotificationState> {
    let displayed = self.inner.displayed.lock().ok()?;
    displayed
      .active
      .iter()
      .find(|s| s.request.id == id)
      .map(|s| s.state)
  }

  #[cfg(test)]
  pub fn active_count(&self) -> usize {
    self
      .inner
      .displayed
      .lock()
      .map(|d| d.active.len())
      .unwrap_or(0)
  }

  /// Record that the user closed a notification without acting on it.
  pub fn dismiss(&self, id: u64) -> Option<NotificationState> {
    let resolved = self.resolve_shown(id, NotificationState::DismissedByUser);
    if resolved.is_some() {
      debug!(id, "Notification dismissed");
    }
    resolved
  }

  fn resolve_shown(&self, id: u64, state: NotificationState) -> Option<NotificationState> {
    let mut displayed = self.inner.displayed.lock().ok()?;
    let index = displayed.active.iter().position(|s| s.request.id == id)?;
    let mut shown = displayed.active.remove(index);
    shown.state = state;
    Some(shown.state)
  }

  fn resolve_url(&self, url: &str) -> String {
    self
      .inner
      .origin
      .join(url)
      .map(|u| u.to_string())
      .unwrap_or_else(|_| url.to_string())
  }

  /// Route a click. Focuses an open view already at the destination,
  /// otherwise opens a new one.
  pub async fn handle_interaction(
    &self,
    id: Option<u64>,
    action: Option<&str>,
    data: &Value,
  ) -> Result<Navigation> {
    if let Some(id) = id {
      self.resolve_shown(id, NotificationState::ActedOn);
    }

    let destination = destination_for(action, data);
    let url = self.resolve_url(&destination);

    let views = match self.inner.views.list().await {
      Ok(views) => views,
      Err(e) => {
        warn!("Failed to list client views: {}", e);
        Vec::new()
      }
    };

    if let Some(view) = views.iter().find(|v| self.resolve_url(&v.url) == url) {
      match self.inner.views.focus(&view.id).await {
        Ok(()) => {
          info!(action = ?action, %url, view = %view.id, "Focused existing view");
          return Ok(Navigation {
            destination,
            url,
            outcome: NavigationOutcome::Focused {
              view_id: view.id.clone(),
            },
          });
        }
        Err(e) => warn!("Failed to focus view {}, opening instead: {}", view.id, e),
      }
    }

    self
      .inner
      .views
      .open(&url)
      .await
      .map_err(|e| eyre!("Failed to open {}: {}", url, e))?;
    info!(action = ?action, %url, "Opened new view");

    Ok(Navigation {
      destination,
      url,
      outcome: NavigationOutcome::Opened,
    })
  }
}
