//! Origin-scoped storage shared by every tab.
//!
//! This module provides the two media the coordination core builds on:
//! - A synchronous, string-keyed [`DurableStore`] for small values (leader
//!   claim, offline queue, validator fallback)
//! - An asynchronous [`ObjectCache`] with per-entry expiry for bulk payloads
//!
//! Every access may fail (disk full, store unavailable, bad data). Reads
//! report failures through [`Lookup::Failed`] and callers collapse them to a
//! miss; nothing in this module is allowed to take a tab down.

mod object_cache;
mod sqlite;

pub use object_cache::{ObjectCache, SqliteObjectCache};
pub use sqlite::{NoopStore, SqliteDurableStore};

use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the in-process "storage changed" channel.
const STORAGE_EVENT_CAPACITY: usize = 256;

/// Error raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for StoreError {}

impl StoreError {
  pub fn new(reason: impl fmt::Display) -> Self {
    Self(reason.to_string())
  }
}

/// Outcome of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
  /// The key holds a value
  Hit(T),
  /// The key holds nothing (or the value expired)
  Miss,
  /// The store could not answer
  Failed(StoreError),
}

impl<T> Lookup<T> {
  /// Collapse to an option. Failures are logged and treated as a miss.
  pub fn into_option(self, context: &str) -> Option<T> {
    match self {
      Lookup::Hit(value) => Some(value),
      Lookup::Miss => None,
      Lookup::Failed(err) => {
        warn!(context, error = %err, "storage read failed, treating as miss");
        None
      }
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
    match self {
      Lookup::Hit(value) => Lookup::Hit(f(value)),
      Lookup::Miss => Lookup::Miss,
      Lookup::Failed(err) => Lookup::Failed(err),
    }
  }
}

/// Log and discard a failed write.
pub fn swallow(result: Result<(), StoreError>, context: &str) {
  if let Err(err) = result {
    warn!(context, error = %err, "storage write failed, ignoring");
  }
}

/// Synchronous string-keyed store visible to every tab of the origin.
pub trait DurableStore: Send + Sync {
  fn get(&self, key: &str) -> Lookup<String>;
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
  fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Notification that a key changed, delivered only to tabs other than the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
  pub key: String,
  pub old_value: Option<String>,
  pub new_value: Option<String>,
  /// Tab that performed the write
  pub origin: String,
}

/// A durable store together with its change notifications.
///
/// One `StorageArea` exists per origin; each tab talks to it through a
/// [`TabStorage`] view.
#[derive(Clone)]
pub struct StorageArea {
  backend: Arc<dyn DurableStore>,
  events: broadcast::Sender<StorageEvent>,
}

impl StorageArea {
  pub fn new(backend: Arc<dyn DurableStore>) -> Self {
    let (events, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
    Self { backend, events }
  }

  /// View of this area as seen by the given tab.
  pub fn for_tab(&self, tab_id: &str) -> TabStorage {
    TabStorage {
      area: self.clone(),
      tab_id: Arc::from(tab_id),
    }
  }
}

/// A tab's handle on the shared durable store.
///
/// Writes that actually change a value publish a [`StorageEvent`] stamped
/// with this tab's id.
#[derive(Clone)]
pub struct TabStorage {
  area: StorageArea,
  tab_id: Arc<str>,
}

impl TabStorage {
  pub fn tab_id(&self) -> &str {
    &self.tab_id
  }

  pub fn get(&self, key: &str) -> Lookup<String> {
    self.area.backend.get(key)
  }

  pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let old_value = self.previous(key);
    self.area.backend.set(key, value)?;
    if old_value.as_deref() != Some(value) {
      self.notify(key, old_value, Some(value.to_string()));
    }
    Ok(())
  }

  pub fn delete(&self, key: &str) -> Result<(), StoreError> {
    let old_value = self.previous(key);
    self.area.backend.delete(key)?;
    if old_value.is_some() {
      self.notify(key, old_value, None);
    }
    Ok(())
  }

  /// Changes made by other tabs, in the order they were written.
  pub fn subscribe(&self) -> StorageEvents {
    StorageEvents {
      rx: self.area.events.subscribe(),
      tab_id: Arc::clone(&self.tab_id),
    }
  }

  fn previous(&self, key: &str) -> Option<String> {
    match self.area.backend.get(key) {
      Lookup::Hit(value) => Some(value),
      _ => None,
    }
  }

  fn notify(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
    // No receivers is normal for a lone tab
    let _ = self.area.events.send(StorageEvent {
      key: key.to_string(),
      old_value,
      new_value,
      origin: self.tab_id.to_string(),
    });
  }
}

/// Stream of storage changes made by other tabs.
pub struct StorageEvents {
  rx: broadcast::Receiver<StorageEvent>,
  tab_id: Arc<str>,
}

impl StorageEvents {
  /// Next foreign change, or `None` once the storage area is gone.
  pub async fn recv(&mut self) -> Option<StorageEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) if event.origin == *self.tab_id => continue,
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "storage event receiver lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}
