//! Context-menu quick actions and the transient toasts reporting them.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

/// Product details shown by a quick view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSummary {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub price: Option<f64>,
  #[serde(default)]
  pub image: Option<String>,
}

/// Storefront operations behind the quick actions.
pub trait QuickActions: Send + Sync {
  fn add_to_cart(&self, product_id: &str, quantity: u32) -> BoxFuture<'_, Result<()>>;
  fn add_to_wishlist(&self, product_id: &str) -> BoxFuture<'_, Result<()>>;
  fn get_product(&self, product_id: &str) -> BoxFuture<'_, Result<ProductSummary>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "action")]
pub enum QuickAction {
  AddToCart {
    product_id: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
  },
  AddToWishlist {
    product_id: String,
  },
  QuickView {
    product_id: String,
  },
  Share {
    product_id: String,
  },
}

fn default_quantity() -> u32 {
  1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
  pub id: u64,
  pub kind: ToastKind,
  pub message: String,
}

/// What the host should do after a quick action besides showing the toast.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "effect")]
pub enum ActionEffect {
  QuickView { product: ProductSummary },
  Share { url: String },
  CopyLink { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
  pub kind: ToastKind,
  pub message: String,
  pub effect: Option<ActionEffect>,
}

impl ActionResult {
  fn success(message: impl Into<String>) -> Self {
    Self {
      kind: ToastKind::Success,
      message: message.into(),
      effect: None,
    }
  }

  fn error(message: impl Into<String>) -> Self {
    Self {
      kind: ToastKind::Error,
      message: message.into(),
      effect: None,
    }
  }

  fn with_effect(mut self, effect: ActionEffect) -> Self {
    self.effect = Some(effect);
    self
  }
}

/// Runs quick actions. Failures become error results, never errors.
#[derive(Clone)]
pub struct QuickActionRunner {
  handlers: Arc<dyn QuickActions>,
  origin: Url,
  can_share: bool,
}

impl QuickActionRunner {
  pub fn new(handlers: Arc<dyn QuickActions>, origin: &str, can_share: bool) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    if origin.cannot_be_a_base() {
      return Err(eyre!("Origin '{}' cannot hold product paths", origin));
    }

    Ok(Self {
      handlers,
      origin,
      can_share,
    })
  }

  /// Public page for a product. The id is percent-encoded as one path segment.
  fn product_url(&self, product_id: &str) -> String {
    let mut url = self.origin.clone();
    url.set_query(None);
    url.set_fragment(None);
    if let Ok(mut segments) = url.path_segments_mut() {
      segments.pop_if_empty().extend(["products", product_id]);
    }
    url.to_string()
  }

  pub async fn run(&self, action: &QuickAction) -> ActionResult {
    let result = match action {
      QuickAction::AddToCart {
        product_id,
        quantity,
      } => match self.handlers.add_to_cart(product_id, *quantity).await {
        Ok(()) => ActionResult::success("Added to cart"),
        Err(e) => {
          warn!(product = %product_id, "Add to cart failed: {}", e);
          ActionResult::error("Could not add to cart")
        }
      },
      QuickAction::AddToWishlist { product_id } => {
        match self.handlers.add_to_wishlist(product_id).await {
          Ok(()) => ActionResult::success("Added to wishlist"),
          Err(e) => {
            warn!(product = %product_id, "Add to wishlist failed: {}", e);
            ActionResult::error("Could not add to wishlist")
          }
        }
      }
      QuickAction::QuickView { product_id } => match self.handlers.get_product(product_id).await {
        Ok(product) => ActionResult::success(format!("Showing {}", product.name))
          .with_effect(ActionEffect::QuickView { product }),
        Err(e) => {
          warn!(product = %product_id, "Quick view failed: {}", e);
          ActionResult::error("Could not load product details")
        }
      },
      QuickAction::Share { product_id } => {
        let url = self.product_url(product_id);
        if self.can_share {
          ActionResult::success("Shared").with_effect(ActionEffect::Share { url })
        } else {
          ActionResult::success("Link copied").with_effect(ActionEffect::CopyLink { url })
        }
      }
    };
    info!(?action, kind = ?result.kind, "Quick action finished");
    result
  }
}

/// Toasts on screen, each dismissed automatically after a fixed duration.
pub struct ToastQueue {
  ttl: Duration,
  next_id: u64,
  shown: VecDeque<(Toast, Instant)>,
}

impl ToastQueue {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      next_id: 0,
      shown: VecDeque::new(),
    }
  }

  pub fn push(&mut self, kind: ToastKind, message: impl Into<String>) -> Toast {
    self.next_id += 1;
    let toast = Toast {
      id: self.next_id,
      kind,
      message: message.into(),
    };
    self.shown.push_back((toast.clone(), Instant::now() + self.ttl));
    toast
  }

  /// Remove toasts past their deadline. Returns their ids.
  pub fn expire(&mut self) -> Vec<u64> {
    let now = Instant::now();
    let mut expired = Vec::new();
    // Same ttl for every toast, so deadlines are ordered
    while let Some((toast, deadline)) = self.shown.front() {
      if *deadline > now {
        break;
      }
      expired.push(toast.id);
      self.shown.pop_front();
    }
    expired
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.shown.len()
  }
}
