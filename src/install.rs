//! Deferred install offer handling.

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::event::{EventSource, Subscription, SubscriptionId};

/// The user's answer to an install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallChoice {
  Accepted,
  Dismissed,
}

/// Result of `prompt_user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
  Accepted,
  Dismissed,
  /// No offer was captured; nothing was shown
  Unavailable,
}

impl From<InstallChoice> for InstallOutcome {
  fn from(choice: InstallChoice) -> Self {
    match choice {
      InstallChoice::Accepted => InstallOutcome::Accepted,
      InstallChoice::Dismissed => InstallOutcome::Dismissed,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallEvent {
  /// An offer was captured and can be surfaced
  OfferAvailable,
  /// The stored offer was used or discarded
  OfferCleared,
  Installed,
}

/// A deferred install offer handed over by the host.
pub trait InstallOffer: Send {
  /// Keep the host from showing its own prompt.
  fn suppress_default(&mut self);

  /// Show the prompt and wait for the user's single choice.
  fn prompt(self: Box<Self>) -> BoxFuture<'static, Result<InstallChoice>>;
}

#[derive(Default)]
struct InstallState {
  offer: Option<Box<dyn InstallOffer>>,
  installed: bool,
}

struct Inner {
  state: Mutex<InstallState>,
  events: EventSource<InstallEvent>,
}

#[derive(Clone)]
pub struct InstallCoordinator {
  inner: Arc<Inner>,
}

impl InstallCoordinator {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(InstallState::default()),
        events: EventSource::new(),
      }),
    }
  }

  pub fn subscribe(&self) -> Subscription<InstallEvent> {
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

  fn with_state<R>(&self, f: impl FnOnce(&mut InstallState) -> R) -> R {
    let mut state = match self.inner.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut state)
  }

  /// Store a host offer and suppress the host's own prompt.
  /// Offers arriving after installation are ignored.
  pub fn capture_offer(&self, mut offer: Box<dyn InstallOffer>) {
    let captured = self.with_state(|s| {
      if s.installed {
        return false;
      }
      offer.suppress_default();
      s.offer = Some(offer);
      true
    });

    if captured {
      info!("Install offer captured");
      self.inner.events.emit(InstallEvent::OfferAvailable);
    } else {
      debug!("Ignoring install offer, app already installed");
    }
  }

  #[cfg(test)]
  pub fn is_available(&self) -> bool {
    self.with_state(|s| s.offer.is_some())
  }

  #[cfg(test)]
  pub fn is_installed(&self) -> bool {
    self.with_state(|s| s.installed)
  }

  /// Surface the stored offer. Without one this returns `Unavailable` and
  /// changes nothing. The offer is consumed whatever the user picks.
  pub async fn prompt_user(&self) -> InstallOutcome {
    let Some(offer) = self.with_state(|s| s.offer.take()) else {
      debug!("Install prompt requested without an offer");
      return InstallOutcome::Unavailable;
    };
    self.inner.events.emit(InstallEvent::OfferCleared);

    let outcome = match offer.prompt().await {
      Ok(choice) => InstallOutcome::from(choice),
      Err(e) => {
        warn!("Install prompt failed: {}", e);
        InstallOutcome::Dismissed
      }
    };
    info!(?outcome, "Install prompt resolved");
    outcome
  }

  /// The host reports the app as installed. Terminal for this session.
  pub fn on_installed(&self) {
    let had_offer = self.with_state(|s| {
      s.installed = true;
      s.offer.take().is_some()
    });
    if had_offer {
      self.inner.events.emit(InstallEvent::OfferCleared);
    }
    info!("App installed");
    self.inner.events.emit(InstallEvent::Installed);
  }
}

impl Default for InstallCoordinator {
  fn default() -> Self {
    Self::new()
  }
}
