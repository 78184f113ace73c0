//! Asynchronous object cache with per-entry expiry.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Lookup, StoreError};
use crate::clock::Clock;

/// Larger, slower store for JSON objects. Entries expire `ttl` after they
/// were written; expiry is checked lazily on read.
#[async_trait]
pub trait ObjectCache: Send + Sync {
  async fn get(&self, key: &str) -> Lookup<Value>;
  async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StoreError>;
  async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// SQLite implementation. Blocking work runs on tokio's blocking pool.
pub struct SqliteObjectCache {
  conn: Arc<Mutex<Connection>>,
  clock: Arc<dyn Clock>,
}

/// Schema for the object table.
const OBJECT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS object_cache (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    expires_at INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteObjectCache {
  pub fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open object cache at {}: {}", path.display(), e))?;
    Self::from_connection(conn, clock)
  }

  pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory object cache: {}", e))?;
    Self::from_connection(conn, clock)
  }

  fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
    conn
      .execute_batch(OBJECT_SCHEMA)
      .map_err(|e| eyre!("Failed to run object cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      clock,
    })
  }

  async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn
        .lock()
        .map_err(|e| StoreError::new(format!("Lock poisoned: {}", e)))?;
      f(&conn)
    })
    .await
    .map_err(|e| StoreError::new(format!("Object cache task failed: {}", e)))?
  }
}

#[async_trait]
impl ObjectCache for SqliteObjectCache {
  async fn get(&self, key: &str) -> Lookup<Value> {
    let key = key.to_string();
    let now = self.clock.now_ms();

    let result = self
      .run(move |conn| {
        conn
          .query_row(
            "SELECT data, expires_at FROM object_cache WHERE key = ?",
            params![key],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
          )
          .optional()
          .map_err(StoreError::new)
      })
      .await;

    match result {
      Ok(Some((_, expires_at))) if expires_at <= now => Lookup::Miss,
      Ok(Some((data, _))) => match serde_json::from_slice(&data) {
        Ok(value) => Lookup::Hit(value),
        Err(e) => Lookup::Failed(StoreError::new(format!("Failed to decode cached object: {}", e))),
      },
      Ok(None) => Lookup::Miss,
      Err(err) => Lookup::Failed(err),
    }
  }

  async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StoreError> {
    let data = serde_json::to_vec(value)
      .map_err(|e| StoreError::new(format!("Failed to encode object: {}", e)))?;
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let expires_at = self.clock.now_ms().saturating_add(ttl_ms);
    let key = key.to_string();

    self
      .run(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO object_cache (key, data, expires_at, cached_at)
             VALUES (?, ?, ?, datetime('now'))",
            params![key, data, expires_at],
          )
          .map_err(StoreError::new)?;
        Ok(())
      })
      .await
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    let key = key.to_string();
    self
      .run(move |conn| {
        conn
          .execute("DELETE FROM object_cache WHERE key = ?", params![key])
          .map_err(StoreError::new)?;
        Ok(())
      })
      .await
  }
}
