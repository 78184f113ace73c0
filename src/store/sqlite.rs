//! SQLite-backed durable store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{DurableStore, Lookup, StoreError};

/// Store that keeps nothing. Used when persistence is disabled or
/// unavailable - every read misses and every write is discarded.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn get(&self, _key: &str) -> Lookup<String> {
    Lookup::Miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<(), StoreError> {
    Ok(())
  }
}

/// Durable key-value store in a single SQLite table.
pub struct SqliteDurableStore {
  conn: Mutex<Connection>,
}

impl SqliteDurableStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Private in-memory store, mostly for tests and simulations.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn with_conn<T>(
    &self,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
  ) -> Result<T, StoreError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| StoreError::new(format!("Lock poisoned: {}", e)))?;
    f(&conn).map_err(StoreError::new)
  }
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteDurableStore {
  fn get(&self, key: &str) -> Lookup<String> {
    let result = self.with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM kv_store WHERE key = ?",
          params![key],
          |row| row.get::<_, String>(0),
        )
        .optional()
    });

    match result {
      Ok(Some(value)) => Lookup::Hit(value),
      Ok(None) => Lookup::Miss,
      Err(err) => Lookup::Failed(err),
    }
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO kv_store (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
    })?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.with_conn(|conn| conn.execute("DELETE FROM kv_store WHERE key = ?", params![key]))?;
    Ok(())
  }
}
