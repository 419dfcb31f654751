//! Response cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedEntry, CachedResponse};
use crate::error::{Error, Result};

/// Trait for response cache backends.
///
/// A backend holds any number of named caches, each mapping a request key
/// to a response.
pub trait CacheStorage: Send + Sync {
  /// Look up an entry in a named cache.
  fn match_entry(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, creating the cache if needed.
  fn put_entry(&self, cache: &str, key: &str, response: &CachedResponse) -> Result<()>;

  /// Store several entries at once; either all are written or none.
  fn put_all(&self, cache: &str, entries: &[(String, CachedResponse)]) -> Result<()>;

  /// Names of all caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Keys stored in a cache.
  fn entry_keys(&self, cache: &str) -> Result<Vec<String>>;

  /// Delete a cache and its entries. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool>;

  fn meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-based response cache.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create a response cache database at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StoreUnavailable(format!("Failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::StoreUnavailable(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::init(conn)
  }

  /// Open a throwaway in-memory cache.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::init(conn)
  }

  fn init(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| Error::SchemaUpgrade(format!("Failed to run cache migrations: {}", e)))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StoreUnavailable(format!("Lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named cache (generation or third-party)
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by a hash of the request key
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    entry_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, entry_hash)
);

-- Proxy bookkeeping such as the last activated generation
CREATE TABLE IF NOT EXISTS cache_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SHA256 hash for stable, fixed-length keys
fn entry_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

fn write_entry(conn: &Connection, cache: &str, key: &str, response: &CachedResponse) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
    params![cache],
  )?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries (cache_name, entry_hash, request_key, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      cache,
      entry_hash(key),
      key,
      response.status,
      headers,
      response.body
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn match_entry(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND entry_hash = ?",
        params![cache, entry_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedEntry {
        response: CachedResponse {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn put_entry(&self, cache: &str, key: &str, response: &CachedResponse) -> Result<()> {
    let conn = self.conn()?;
    write_entry(&conn, cache, key, response)
  }

  fn put_all(&self, cache: &str, entries: &[(String, CachedResponse)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    for (key, response) in entries {
      write_entry(&tx, cache, key, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_names ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn entry_keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT request_key FROM cache_entries WHERE cache_name = ? ORDER BY request_key",
    )?;
    let keys = stmt
      .query_map(params![cache], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )?;
    let deleted = tx.execute("DELETE FROM cache_names WHERE name = ?", params![cache])?;
    tx.commit()?;
    Ok(deleted > 0)
  }

  fn meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM cache_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| Error::InvalidPayload(format!("Failed to parse datetime '{}': {}", s, e)))
}
