//! HTTP access to the storefront origin.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::actions::{ProductSummary, QuickActions};
use crate::cache::{FetchedResponse, Fetcher};
use crate::sync::{SyncHandler, CART_SYNC, PRICE_REFRESH, WISHLIST_SYNC};

/// Response headers worth persisting alongside a cached body
const KEPT_HEADERS: &[&str] = &[
  "cache-control",
  "content-language",
  "content-type",
  "etag",
  "last-modified",
];

#[derive(Serialize)]
struct CartItemRequest<'a> {
  product_id: &'a str,
  quantity: u32,
}

#[derive(Serialize)]
struct WishlistItemRequest<'a> {
  product_id: &'a str,
}

/// Storefront API client
#[derive(Clone)]
pub struct StorefrontClient {
  client: reqwest::Client,
  base: Url,
}

impl StorefrontClient {
  pub fn new(origin: &str) -> Result<Self> {
    let base = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;

    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(5))
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  /// Resolve a path or absolute URL against the origin
  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
    let url = self.endpoint(path)?;
    let response = self
      .client
      .post(url)
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to POST {}: {}", path, e))?;

    if !response.status().is_success() {
      return Err(eyre!("POST {} returned {}", path, response.status()));
    }
    Ok(())
  }
}

impl Fetcher for StorefrontClient {
  fn fetch(&self, url: &str) -> BoxFuture<'static, Result<FetchedResponse>> {
    let client = self.client.clone();
    let target = self.endpoint(url);
    async move {
      let target = target?;
      debug!(url = %target, "Fetching");
      let response = client
        .get(target.clone())
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", target, e))?;

      let status = response.status().as_u16();
      let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter(|(name, _)| KEPT_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", target, e))?;

      Ok(FetchedResponse {
        status,
        headers,
        body: body.to_vec(),
      })
    }
    .boxed()
  }
}

impl QuickActions for StorefrontClient {
  fn add_to_cart(&self, product_id: &str, quantity: u32) -> BoxFuture<'_, Result<()>> {
    let product_id = product_id.to_string();
    async move {
      let request = CartItemRequest {
        product_id: &product_id,
        quantity,
      };
      self.post_json("/api/cart/items", &request).await
    }
    .boxed()
  }

  fn add_to_wishlist(&self, product_id: &str) -> BoxFuture<'_, Result<()>> {
    let product_id = product_id.to_string();
    async move {
      let request = WishlistItemRequest {
        product_id: &product_id,
      };
      self.post_json("/api/wishlist/items", &request).await
    }
    .boxed()
  }

  fn get_product(&self, product_id: &str) -> BoxFuture<'_, Result<ProductSummary>> {
    let path = format!("/api/products/{}", product_id);
    async move {
      let url = self.endpoint(&path)?;
      let response = self
        .client
        .get(url)
        .send()
        .await
        .map_err(|e| eyre!("Failed to get product: {}", e))?;

      if !response.status().is_success() {
        return Err(eyre!("GET {} returned {}", path, response.status()));
      }

      response
        .json::<ProductSummary>()
        .await
        .map_err(|e| eyre!("Failed to parse product: {}", e))
    }
    .boxed()
  }
}

/// Sync handler that posts to one origin endpoint per wake.
pub struct EndpointSyncHandler {
  client: StorefrontClient,
  path: &'static str,
}

impl SyncHandler for EndpointSyncHandler {
  fn run(&self) -> BoxFuture<'static, Result<()>> {
    let client = self.client.clone();
    let path = self.path;
    async move { client.post_json(path, &serde_json::json!({})).await }.boxed()
  }
}

/// The fixed handler set for the default periodic tasks.
pub fn sync_handlers(client: &StorefrontClient) -> HashMap<String, Arc<dyn SyncHandler>> {
  [
    (CART_SYNC, "/api/sync/cart"),
    (PRICE_REFRESH, "/api/sync/prices"),
    (WISHLIST_SYNC, "/api/sync/wishlist"),
  ]
  .into_iter()
  .map(|(name, path)| {
    let handler: Arc<dyn SyncHandler> = Arc::new(EndpointSyncHandler {
      client: client.clone(),
      path,
    });
    (name.to_string(), handler)
  })
  .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_resolves_against_origin() {
    let client = StorefrontClient::new("https://shop.example.com/").unwrap();

    assert_eq!(
      client.endpoint("/api/cart/items").unwrap().as_str(),
      "https://shop.example.com/api/cart/items"
    );
    assert_eq!(
      client.endpoint("https://cdn.example.com/a.png").unwrap().as_str(),
      "https://cdn.example.com/a.png"
    );
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    assert!(StorefrontClient::new("not a url").is_err());
  }

  #[test]
  fn test_sync_handlers_cover_default_tasks() {
    let client = StorefrontClient::new("https://shop.example.com").unwrap();
    let handlers = sync_handlers(&client);

    let mut names: Vec<&str> = handlers.keys().map(String::as_str).collect();
    names.sort();
    assert_eq!(names, vec![CART_SYNC, PRICE_REFRESH, WISHLIST_SYNC]);
  }

  #[test]
  fn test_cart_request_wire_format() {
    let body = serde_json::to_value(CartItemRequest {
      product_id: "p1",
      quantity: 2,
    })
    .unwrap();
    assert_eq!(body, serde_json::json!({"product_id": "p1", "quantity": 2}));
  }
}
