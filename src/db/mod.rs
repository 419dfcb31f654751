//! Local durable store: a versioned SQLite database with one table per
//! collection.
//!
//! The store is opened fresh for every logical operation. Each operation on a
//! [`StoreHandle`] runs in its own transaction scoped to one collection, so
//! there is no atomicity across collections.

pub mod schema;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Restaurant, Review};
use schema::{MIGRATIONS, STORE_NAME, STORE_VERSION};

/// Named collections of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Restaurants,
  Reviews,
  DispatchQueue,
}

impl Collection {
  pub const ALL: [Collection; 3] = [
    Collection::Restaurants,
    Collection::Reviews,
    Collection::DispatchQueue,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Collection::Restaurants => "restaurants",
      Collection::Reviews => "reviews",
      Collection::DispatchQueue => "dispatch-queue",
    }
  }

  fn table(self) -> &'static str {
    match self {
      Collection::Restaurants => "restaurants",
      Collection::Reviews => "reviews",
      Collection::DispatchQueue => "dispatch_queue",
    }
  }
}

/// Trait for records persisted in a collection.
pub trait Record: Serialize + DeserializeOwned {
  const COLLECTION: Collection;

  /// Store key, or `None` to let the collection assign the next key.
  fn key(&self) -> Option<i64>;
}

impl Record for Restaurant {
  const COLLECTION: Collection = Collection::Restaurants;

  fn key(&self) -> Option<i64> {
    Some(self.id)
  }
}

impl Record for Review {
  const COLLECTION: Collection = Collection::Reviews;

  fn key(&self) -> Option<i64> {
    Some(self.id)
  }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
  ReadOnly,
  ReadWrite,
}

/// Location of the durable store. Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub struct LocalStore {
  path: PathBuf,
}

impl LocalStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Get the default store path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::StoreUnavailable("Could not determine data directory".into()))?;

    Ok(
      data_dir
        .join("restaurant-sync")
        .join(format!("{}.db", STORE_NAME)),
    )
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Open or create the store, upgrading the schema when it is behind.
  pub fn open(&self) -> Result<StoreHandle> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StoreUnavailable(format!(
          "Failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(&self.path).map_err(|e| {
      Error::StoreUnavailable(format!(
        "Failed to open store at {}: {}",
        self.path.display(),
        e
      ))
    })?;
    conn
      .pragma_update(None, "journal_mode", "WAL")
      .map_err(|e| Error::StoreUnavailable(format!("Failed to configure store: {}", e)))?;

    let mut handle = StoreHandle { conn };
    handle.upgrade()?;
    Ok(handle)
  }
}

/// An open connection to the store.
pub struct StoreHandle {
  conn: Connection,
}

impl StoreHandle {
  /// Schema version recorded in the store.
  pub fn version(&self) -> Result<u32> {
    let version = self
      .conn
      .pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
  }

  fn upgrade(&mut self) -> Result<()> {
    let current: u32 = self
      .conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| Error::SchemaUpgrade(format!("Failed to read schema version: {}", e)))?;

    if current > STORE_VERSION {
      return Err(Error::SchemaUpgrade(format!(
        "store version {} is newer than supported version {}",
        current, STORE_VERSION
      )));
    }

    for &(version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
      debug!(from = current, to = version, "Upgrading store schema");
      apply_migration(&mut self.conn, version, sql).map_err(|e| {
        Error::SchemaUpgrade(format!("Failed to upgrade to version {}: {}", version, e))
      })?;
    }

    Ok(())
  }

  fn transaction(&self, mode: Mode) -> Result<Transaction<'_>> {
    let behavior = match mode {
      Mode::ReadOnly => TransactionBehavior::Deferred,
      Mode::ReadWrite => TransactionBehavior::Immediate,
    };
    Ok(Transaction::new_unchecked(&self.conn, behavior)?)
  }

  /// Get a single record by key.
  pub fn get<T: Record>(&self, key: i64) -> Result<Option<T>> {
    match self.get_raw(T::COLLECTION, key)? {
      Some(data) => Ok(Some(serde_json::from_str(&data)?)),
      None => Ok(None),
    }
  }

  /// Get the serialized form of a record, for callers that decode it themselves.
  pub fn get_raw(&self, collection: Collection, key: i64) -> Result<Option<String>> {
    let tx = self.transaction(Mode::ReadOnly)?;
    let data = tx
      .query_row(
        &format!("SELECT data FROM {} WHERE key = ?", collection.table()),
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    tx.commit()?;
    Ok(data)
  }

  /// Get every record of the collection in key order.
  pub fn get_all<T: Record>(&self) -> Result<Vec<T>> {
    self.get_all_where(|_: &T| true)
  }

  /// Walk the collection in key order, keeping the records that match.
  ///
  /// Rows are decoded one at a time as the cursor advances. Each call walks
  /// the collection again.
  pub fn get_all_where<T, P>(&self, mut predicate: P) -> Result<Vec<T>>
  where
    T: Record,
    P: FnMut(&T) -> bool,
  {
    let tx = self.transaction(Mode::ReadOnly)?;
    let mut out = Vec::new();
    {
      let mut stmt = tx.prepare(&format!(
        "SELECT data FROM {} ORDER BY key",
        T::COLLECTION.table()
      ))?;
      let mut rows = stmt.query([])?;
      while let Some(row) = rows.next()? {
        let data: String = row.get(0)?;
        let record: T = serde_json::from_str(&data)?;
        if predicate(&record) {
          out.push(record);
        }
      }
    }
    tx.commit()?;
    Ok(out)
  }

  /// All keys of the collection in ascending order.
  pub fn keys(&self, collection: Collection) -> Result<Vec<i64>> {
    let tx = self.transaction(Mode::ReadOnly)?;
    let keys = {
      let mut stmt = tx.prepare(&format!(
        "SELECT key FROM {} ORDER BY key",
        collection.table()
      ))?;
      let rows = stmt.query_map([], |row| row.get(0))?;
      rows.collect::<rusqlite::Result<Vec<i64>>>()?
    };
    tx.commit()?;
    Ok(keys)
  }

  /// Insert a record, failing if its key is already present.
  ///
  /// Returns the record's key, which is newly assigned when the record has none.
  pub fn add<T: Record>(&self, record: &T) -> Result<i64> {
    let tx = self.transaction(Mode::ReadWrite)?;
    let key = insert(&tx, record, "INSERT")?;
    tx.commit()?;
    Ok(key)
  }

  /// Insert or replace a record.
  pub fn put<T: Record>(&self, record: &T) -> Result<i64> {
    let tx = self.transaction(Mode::ReadWrite)?;
    let key = insert(&tx, record, "INSERT OR REPLACE")?;
    tx.commit()?;
    Ok(key)
  }

  /// Replace the whole collection with `records`.
  pub fn replace_all<T: Record>(&self, records: &[T]) -> Result<()> {
    let tx = self.transaction(Mode::ReadWrite)?;
    tx.execute(&format!("DELETE FROM {}", T::COLLECTION.table()), [])?;
    for record in records {
      insert(&tx, record, "INSERT OR REPLACE")?;
    }
    tx.commit()?;
    Ok(())
  }

  /// Replace the record stored under `match_key`.
  ///
  /// The match key is the store key, which is unique, so at most one record
  /// is touched. Fails with [`Error::NotFound`] when nothing matches.
  pub fn update_where<T: Record>(&self, match_key: i64, record: &T) -> Result<()> {
    if let Some(key) = record.key().filter(|k| *k != match_key) {
      return Err(Error::InvalidPayload(format!(
        "record key {} does not match {}",
        key, match_key
      )));
    }

    let data = serde_json::to_string(record)?;
    let tx = self.transaction(Mode::ReadWrite)?;
    let updated = tx.execute(
      &format!("UPDATE {} SET data = ? WHERE key = ?", T::COLLECTION.table()),
      params![data, match_key],
    )?;
    if updated == 0 {
      return Err(Error::NotFound(format!(
        "{} record {}",
        T::COLLECTION.name(),
        match_key
      )));
    }
    tx.commit()?;
    Ok(())
  }

  /// Delete a record. Returns whether a record was removed.
  pub fn delete_key(&self, collection: Collection, key: i64) -> Result<bool> {
    let tx = self.transaction(Mode::ReadWrite)?;
    let deleted = tx.execute(
      &format!("DELETE FROM {} WHERE key = ?", collection.table()),
      params![key],
    )?;
    tx.commit()?;
    Ok(deleted > 0)
  }

  /// Remove every record of the collection.
  pub fn clear(&self, collection: Collection) -> Result<usize> {
    let tx = self.transaction(Mode::ReadWrite)?;
    let count = tx.execute(&format!("DELETE FROM {}", collection.table()), [])?;
    tx.commit()?;
    Ok(count)
  }

  /// Names of the collections currently present.
  pub fn collections(&self) -> Result<Vec<&'static str>> {
    let mut present = Vec::new();
    for collection in Collection::ALL {
      let exists: Option<String> = self
        .conn
        .query_row(
          "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
          params![collection.table()],
          |row| row.get(0),
        )
        .optional()?;
      if exists.is_some() {
        present.push(collection.name());
      }
    }
    Ok(present)
  }
}

fn apply_migration(conn: &mut Connection, version: u32, sql: &str) -> rusqlite::Result<()> {
  let tx = conn.transaction()?;
  tx.execute_batch(sql)?;
  tx.pragma_update(None, "user_version", version)?;
  tx.commit()
}

fn insert<T: Record>(tx: &Transaction<'_>, record: &T, verb: &str) -> Result<i64> {
  let data = serde_json::to_string(record)?;
  let table = T::COLLECTION.table();
  match record.key() {
    Some(key) => {
      tx.execute(
        &format!("{} INTO {} (key, data) VALUES (?, ?)", verb, table),
        params![key, data],
      )?;
      Ok(key)
    }
    None => {
      tx.execute(
        &format!("{} INTO {} (data) VALUES (?)", verb, table),
        params![data],
      )?;
      Ok(tx.last_insert_rowid())
    }
  }
}
