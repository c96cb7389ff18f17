//! Content-addressed resource cache with visibility-driven population.
//!
//! This module provides:
//! - A persistent, namespaced key → response store (SQLite, or a no-op store
//!   when the host has no cache storage)
//! - Namespace routing with per-namespace count and age bounds
//! - At-most-one in-flight fetch per key
//! - Proximity-triggered population from UI observations

mod manager;
mod namespace;
mod store;
mod types;

pub use manager::CacheManager;
pub use namespace::NamespaceResolver;
pub use store::{CacheStore, NoopStore, SqliteStore};
pub use types::{CacheStats, EntryState, FetchedResponse, Fetcher, PopulateReport, ResourceRef};
