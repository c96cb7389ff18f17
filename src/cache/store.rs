//! Cache store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::CachedResponse;

/// Trait for persistent cache backends.
///
/// Namespaces partition the store; keys are resource URLs.
pub trait CacheStore: Send + Sync {
  /// Create the namespace if it does not exist.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Look up a single entry.
  fn match_key(&self, namespace: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Insert or replace an entry. Opens the namespace if needed.
  fn put(&self, namespace: &str, key: &str, response: &CachedResponse) -> Result<()>;

  /// Drop a whole namespace. Returns false if it did not exist.
  fn delete(&self, namespace: &str) -> Result<bool>;

  /// Keys in a namespace, oldest first.
  fn keys(&self, namespace: &str) -> Result<Vec<String>>;

  /// Remove a single entry.
  fn remove(&self, namespace: &str, key: &str) -> Result<bool>;

  /// Remove entries cached before `cutoff`. Returns the number removed.
  fn purge_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Store used when the host offers no cache storage.
/// Every lookup misses and every write is discarded.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn open(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }

  fn match_key(&self, _namespace: &str, _key: &str) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _namespace: &str, _key: &str, _response: &CachedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _namespace: &str) -> Result<bool> {
    Ok(false)
  }

  fn keys(&self, _namespace: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn remove(&self, _namespace: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn purge_older_than(&self, _namespace: &str, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location.
  pub fn open_at(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  #[cfg(test)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("storefront-offline").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Entries are addressed by the SHA-256 of their URL
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_age
    ON cache_entries(namespace, cached_at);
"#;

impl CacheStore for SqliteStore {
  fn open(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn match_key(&self, namespace: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND key_hash = ?",
        params![namespace, key_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          status,
          headers,
          body,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &str, response: &CachedResponse) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let written = conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![namespace],
      )
      .and_then(|_| {
        conn.execute(
          "INSERT OR REPLACE INTO cache_entries (namespace, key_hash, url, status, headers, body, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          params![
            namespace,
            key_hash(key),
            key,
            response.status,
            headers,
            response.body,
            format_datetime(response.cached_at)
          ],
        )
      });

    if let Err(e) = written {
      let _ = conn.execute("ROLLBACK", []);
      return Err(eyre!("Failed to store {}: {}", key, e));
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, namespace: &str) -> Result<bool> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM cache_entries WHERE namespace = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let removed = conn
      .execute("DELETE FROM cache_namespaces WHERE name = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT url FROM cache_entries WHERE namespace = ?
         ORDER BY cached_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", namespace, e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;
    Ok(removed > 0)
  }

  fn purge_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND cached_at < ?",
        params![namespace, format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge {}: {}", namespace, e))?;
    Ok(removed)
  }
}

/// Stable, fixed-length storage key for a URL.
fn key_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
