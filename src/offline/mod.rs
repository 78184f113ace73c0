//! Offline mutation queue.
//!
//! Mutating requests that could not reach the network are recorded in the
//! shared durable store and replayed, oldest first, when connectivity comes
//! back. A failed replay keeps its operation at the head of the queue and
//! stops the drain, so later operations never overtake it (a create must
//! land before the update that follows it). Delivery is at-least-once: an
//! operation whose success could not be recorded is replayed again.

mod replay;

pub use replay::{HttpReplayer, ReplayError, Replayer};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::clock::{to_iso8601, Clock};
use crate::store::{Lookup, StoreError, TabStorage};

/// Store key holding the queue as a JSON array.
pub const QUEUE_KEY: &str = "tabsync:offline-queue";

/// A mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  pub id: String,
  pub method: String,
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
  pub enqueued_at: i64,
  pub attempts: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

/// Progress of the most recent drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
  pub in_progress: bool,
  /// When the queue was last drained completely
  pub last_sync_at: Option<String>,
  pub last_error: Option<String>,
}

type SyncCallback = Arc<dyn Fn(bool, &QueuedOperation) + Send + Sync>;

pub struct OfflineQueue {
  storage: TabStorage,
  replayer: Arc<dyn Replayer>,
  clock: Arc<dyn Clock>,
  status: Mutex<SyncStatus>,
  observers: Mutex<Vec<SyncCallback>>,
  draining: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
  pub fn new(storage: TabStorage, replayer: Arc<dyn Replayer>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      replayer,
      clock,
      status: Mutex::new(SyncStatus::default()),
      observers: Mutex::new(Vec::new()),
      draining: tokio::sync::Mutex::new(()),
    }
  }

  /// Record a mutation for later replay.
  ///
  /// Fails without touching the stored queue when the queue cannot be read,
  /// so a transient read error never overwrites operations already waiting.
  pub fn enqueue(
    &self,
    method: &str,
    url: &str,
    body: Option<Value>,
  ) -> Result<QueuedOperation, StoreError> {
    let operation = QueuedOperation {
      id: uuid::Uuid::new_v4().to_string(),
      method: method.to_uppercase(),
      url: url.to_string(),
      body,
      enqueued_at: self.clock.now_ms(),
      attempts: 0,
      last_error: None,
    };

    let mut queue = match self.load_queue() {
      Lookup::Hit(queue) => queue,
      Lookup::Miss => Vec::new(),
      Lookup::Failed(err) => {
        error!(id = %operation.id, error = %err, "offline queue unreadable, refusing to enqueue");
        return Err(err);
      }
    };

    queue.push(operation.clone());
    if let Err(err) = self.save(&queue) {
      error!(id = %operation.id, error = %err, "failed to persist offline mutation");
      return Err(err);
    }
    info!(id = %operation.id, method = %operation.method, url = %operation.url, "queued offline mutation");
    Ok(operation)
  }

  /// Queued operations, oldest first.
  pub fn pending(&self) -> Vec<QueuedOperation> {
    self.load()
  }

  pub fn get_pending_count(&self) -> usize {
    self.load().len()
  }

  pub fn get_sync_status(&self) -> SyncStatus {
    self
      .status
      .lock()
      .map(|status| status.clone())
      .unwrap_or_default()
  }

  /// Register an observer called after every replay attempt.
  pub fn on_sync<F>(&self, callback: F)
  where
    F: Fn(bool, &QueuedOperation) + Send + Sync + 'static,
  {
    if let Ok(mut observers) = self.observers.lock() {
      observers.push(Arc::new(callback));
    }
  }

  /// Replay queued operations in order until the queue is empty or one fails.
  ///
  /// Returns the operations that were replayed successfully, in replay
  /// order. Returns immediately if a drain is already running in this tab.
  /// An unreadable queue stops the drain without rewriting it.
  pub async fn sync_queue(&self) -> Vec<QueuedOperation> {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("offline queue drain already in progress");
      return Vec::new();
    };

    self.update_status(|status| status.in_progress = true);
    let mut failure = None;
    let mut replayed = Vec::new();

    loop {
      let head = match self.load_queue() {
        Lookup::Hit(queue) => queue.into_iter().next(),
        Lookup::Miss => None,
        Lookup::Failed(err) => {
          failure = Some(format!("could not read offline queue: {}", err));
          break;
        }
      };
      let Some(head) = head else {
        break;
      };

      let outcome = self.replayer.replay(&head).await;

      // Re-read: other tabs may have enqueued while we were waiting
      let mut queue = match self.load_queue() {
        Lookup::Hit(queue) => queue,
        Lookup::Miss => Vec::new(),
        Lookup::Failed(err) => {
          failure = Some(format!("could not read offline queue after replay of {}: {}", head.id, err));
          break;
        }
      };
      let Some(position) = queue.iter().position(|op| op.id == head.id) else {
        debug!(id = %head.id, "operation left the queue during replay");
        continue;
      };

      let mut attempted = queue[position].clone();
      attempted.attempts += 1;

      match outcome {
        Ok(()) => {
          queue.remove(position);
          let saved = self.save(&queue);
          info!(id = %attempted.id, url = %attempted.url, "replayed offline mutation");
          self.notify(true, &attempted);
          replayed.push(attempted.clone());
          if let Err(err) = saved {
            failure = Some(format!("could not record replay of {}: {}", attempted.id, err));
            break;
          }
        }
        Err(err) => {
          attempted.last_error = Some(err.to_string());
          queue[position] = attempted.clone();
          if let Err(save_err) = self.save(&queue) {
            warn!(id = %attempted.id, error = %save_err, "could not record failed attempt");
          }
          warn!(
            id = %attempted.id,
            attempts = attempted.attempts,
            error = %err,
            "replay failed, keeping operation at head of queue"
          );
          self.notify(false, &attempted);
          failure = Some(err.to_string());
          break;
        }
      }
    }

    let now = to_iso8601(self.clock.now_ms());
    self.update_status(|status| {
      status.in_progress = false;
      match failure {
        Some(err) => status.last_error = Some(err),
        None => {
          status.last_error = None;
          status.last_sync_at = Some(now);
        }
      }
    });
    replayed
  }

  /// Stored queue. Undecodable contents count as a failed read.
  fn load_queue(&self) -> Lookup<Vec<QueuedOperation>> {
    match self.storage.get(QUEUE_KEY) {
      Lookup::Hit(raw) => match serde_json::from_str(&raw) {
        Ok(queue) => Lookup::Hit(queue),
        Err(e) => Lookup::Failed(StoreError::new(format!("Failed to decode offline queue: {}", e))),
      },
      Lookup::Miss => Lookup::Miss,
      Lookup::Failed(err) => Lookup::Failed(err),
    }
  }

  /// Read-only view; an unreadable queue shows as empty.
  fn load(&self) -> Vec<QueuedOperation> {
    self
      .load_queue()
      .into_option("read offline queue")
      .unwrap_or_default()
  }

  fn save(&self, queue: &[QueuedOperation]) -> Result<(), StoreError> {
    if queue.is_empty() {
      return self.storage.delete(QUEUE_KEY);
    }
    let raw = serde_json::to_string(queue)
      .map_err(|e| StoreError::new(format!("Failed to encode offline queue: {}", e)))?;
    self.storage.set(QUEUE_KEY, &raw)
  }

  fn update_status(&self, apply: impl FnOnce(&mut SyncStatus)) {
    if let Ok(mut status) = self.status.lock() {
      apply(&mut status);
    }
  }

  fn notify(&self, success: bool, operation: &QueuedOperation) {
    let observers: Vec<SyncCallback> = match self.observers.lock() {
      Ok(observers) => observers.clone(),
      Err(_) => return,
    };
    for observer in observers {
      observer(success, operation);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::{DurableStore, SqliteDurableStore, StorageArea};
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::HashSet;
  use std::sync::atomic::{AtomicBool, Ordering};

  /// Durable store whose next read can be made to fail once.
  struct FlakyStore {
    inner: SqliteDurableStore,
    fail_next_get: AtomicBool,
  }

  impl FlakyStore {
    fn new() -> Self {
      Self {
        inner: SqliteDurableStore::open_in_memory().unwrap(),
        fail_next_get: AtomicBool::new(false),
      }
    }

    fn fail_next_read(&self) {
      self.fail_next_get.store(true, Ordering::SeqCst);
    }
  }

  impl DurableStore for FlakyStore {
    fn get(&self, key: &str) -> Lookup<String> {
      if self.fail_next_get.swap(false, Ordering::SeqCst) {
        return Lookup::Failed(StoreError::new("storage temporarily unavailable"));
      }
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
      self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
      self.inner.delete(key)
    }
  }

  /// Replayer that fails for chosen URLs and records what it was asked to send.
  #[derive(Default)]
  struct ScriptedReplayer {
    failing: Mutex<HashSet<String>>,
    sent: Mutex<Vec<String>>,
  }

  impl ScriptedReplayer {
    fn failing(urls: &[&str]) -> Self {
      Self {
        failing: Mutex::new(urls.iter().map(|u| u.to_string()).collect()),
        sent: Mutex::new(Vec::new()),
      }
    }

    fn heal(&self, url: &str) {
      self.failing.lock().unwrap().remove(url);
    }

    fn sent(&self) -> Vec<String> {
      self.sent.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Replayer for ScriptedReplayer {
    async fn replay(&self, operation: &QueuedOperation) -> Result<(), ReplayError> {
      self.sent.lock().unwrap().push(operation.url.clone());
      if self.failing.lock().unwrap().contains(&operation.url) {
        Err(ReplayError::Status(503))
      } else {
        Ok(())
      }
    }
  }

  fn queue_with(replayer: Arc<ScriptedReplayer>) -> OfflineQueue {
    let area = StorageArea::new(Arc::new(SqliteDurableStore::open_in_memory().unwrap()));
    OfflineQueue::new(area.for_tab("t"), replayer, Arc::new(ManualClock::new(0)))
  }

  fn urls(queue: &OfflineQueue) -> Vec<String> {
    queue.pending().into_iter().map(|op| op.url).collect()
  }

  #[tokio::test]
  async fn test_enqueue_records_operations_in_order() {
    let queue = queue_with(Arc::new(ScriptedReplayer::default()));
    queue.enqueue("post", "/diseases", Some(json!({ "name": "flu" }))).unwrap();
    queue.enqueue("PATCH", "/diseases/1", None).unwrap();

    assert_eq!(queue.get_pending_count(), 2);
    let pending = queue.pending();
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].body, Some(json!({ "name": "flu" })));
    assert_eq!(pending[1].attempts, 0);
  }

  #[tokio::test]
  async fn test_failed_entry_blocks_later_entries() {
    let replayer = Arc::new(ScriptedReplayer::failing(&["B"]));
    let queue = queue_with(replayer.clone());
    for url in ["A", "B", "C"] {
      queue.enqueue("POST", url, None).unwrap();
    }

    queue.sync_queue().await;

    assert_eq!(urls(&queue), vec!["B", "C"]);
    assert_eq!(replayer.sent(), vec!["A", "B"]);
    let head = &queue.pending()[0];
    assert_eq!(head.attempts, 1);
    assert_eq!(
      head.last_error.as_deref(),
      Some("server responded with status 503")
    );

    let status = queue.get_sync_status();
    assert!(!status.in_progress);
    assert_eq!(
      status.last_error.as_deref(),
      Some("server responded with status 503")
    );
    assert_eq!(status.last_sync_at, None);
  }

  #[tokio::test]
  async fn test_next_sync_retries_the_same_head() {
    let replayer = Arc::new(ScriptedReplayer::failing(&["B"]));
    let queue = queue_with(replayer.clone());
    for url in ["A", "B", "C"] {
      queue.enqueue("POST", url, None).unwrap();
    }

    queue.sync_queue().await;
    queue.sync_queue().await;
    assert_eq!(queue.pending()[0].attempts, 2);

    replayer.heal("B");
    queue.sync_queue().await;

    assert_eq!(queue.get_pending_count(), 0);
    assert_eq!(replayer.sent(), vec!["A", "B", "B", "B", "C"]);
    let status = queue.get_sync_status();
    assert_eq!(status.last_error, None);
    assert_eq!(status.last_sync_at.as_deref(), Some("1970-01-01T00:00:00.000Z"));
  }

  #[tokio::test]
  async fn test_observers_see_every_attempt() {
    let replayer = Arc::new(ScriptedReplayer::failing(&["B"]));
    let queue = queue_with(replayer);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue.on_sync(move |success, op| {
      sink.lock().unwrap().push((success, op.url.clone(), op.attempts));
    });

    for url in ["A", "B"] {
      queue.enqueue("DELETE", url, None).unwrap();
    }
    queue.sync_queue().await;

    assert_eq!(
      *seen.lock().unwrap(),
      vec![(true, "A".to_string(), 1), (false, "B".to_string(), 1)]
    );
  }

  #[tokio::test]
  async fn test_empty_queue_sync_is_clean() {
    let queue = queue_with(Arc::new(ScriptedReplayer::default()));
    queue.sync_queue().await;

    let status = queue.get_sync_status();
    assert!(!status.in_progress);
    assert!(status.last_sync_at.is_some());
    assert_eq!(status.last_error, None);
  }

  #[tokio::test]
  async fn test_queue_survives_a_new_instance() {
    let area = StorageArea::new(Arc::new(SqliteDurableStore::open_in_memory().unwrap()));
    let clock = Arc::new(ManualClock::new(0));
    let replayer = Arc::new(ScriptedReplayer::default());

    let first = OfflineQueue::new(area.for_tab("a"), replayer.clone(), clock.clone());
    first.enqueue("PUT", "/patients/9", Some(json!({ "age": 40 }))).unwrap();
    drop(first);

    let second = OfflineQueue::new(area.for_tab("b"), replayer.clone(), clock);
    assert_eq!(second.get_pending_count(), 1);
    second.sync_queue().await;
    assert_eq!(replayer.sent(), vec!["/patients/9"]);
  }

  #[tokio::test]
  async fn test_enqueue_keeps_queue_when_read_fails() {
    let store = Arc::new(FlakyStore::new());
    let area = StorageArea::new(store.clone());
    let queue = OfflineQueue::new(
      area.for_tab("t"),
      Arc::new(ScriptedReplayer::default()),
      Arc::new(ManualClock::new(0)),
    );
    queue.enqueue("POST", "A", None).unwrap();
    queue.enqueue("POST", "B", None).unwrap();

    store.fail_next_read();
    assert!(queue.enqueue("POST", "C", None).is_err());

    assert_eq!(urls(&queue), vec!["A", "B"]);
    queue.enqueue("POST", "C", None).unwrap();
    assert_eq!(urls(&queue), vec!["A", "B", "C"]);
  }

  #[tokio::test]
  async fn test_enqueue_refuses_to_overwrite_undecodable_queue() {
    let area = StorageArea::new(Arc::new(SqliteDurableStore::open_in_memory().unwrap()));
    let storage = area.for_tab("t");
    storage.set(QUEUE_KEY, "not json").unwrap();
    let queue = OfflineQueue::new(
      storage.clone(),
      Arc::new(ScriptedReplayer::default()),
      Arc::new(ManualClock::new(0)),
    );

    assert!(queue.enqueue("POST", "A", None).is_err());
    assert_eq!(storage.get(QUEUE_KEY), Lookup::Hit("not json".to_string()));
  }

  #[tokio::test]
  async fn test_sync_stops_when_queue_cannot_be_read() {
    let store = Arc::new(FlakyStore::new());
    let area = StorageArea::new(store.clone());
    let replayer = Arc::new(ScriptedReplayer::default());
    let queue = OfflineQueue::new(area.for_tab("t"), replayer.clone(), Arc::new(ManualClock::new(0)));
    queue.enqueue("POST", "A", None).unwrap();

    store.fail_next_read();
    let replayed = queue.sync_queue().await;

    assert!(replayed.is_empty());
    assert!(replayer.sent().is_empty());
    assert_eq!(urls(&queue), vec!["A"]);
    assert!(queue.get_sync_status().last_error.is_some());
  }

  #[tokio::test]
  async fn test_sync_returns_replayed_operations_in_order() {
    let queue = queue_with(Arc::new(ScriptedReplayer::failing(&["C"])));
    for url in ["A", "B", "C"] {
      queue.enqueue("POST", url, None).unwrap();
    }

    let replayed = queue.sync_queue().await;
    let replayed: Vec<String> = replayed.into_iter().map(|op| op.url).collect();
    assert_eq!(replayed, vec!["A", "B"]);
  }
}
