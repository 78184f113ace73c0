//! Conditional-request metadata persisted across sessions.
//!
//! For every normalized resource key the cache remembers the last validator
//! the server handed out (`ETag` / `Last-Modified`) and when the resource was
//! last synchronized. The data-access layer consults it before a read to
//! decide between a full fetch and a conditional revalidation, and records
//! the response validators afterwards.
//!
//! All entries live in one map under [`CONDITIONAL_CACHE_KEY`]. The map is
//! read from the object cache first and from the durable store when the
//! object cache fails or is empty; every write goes to both.

mod key;

pub use key::normalize_resource_key;

use reqwest::header::{
  HeaderMap, HeaderName, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{to_iso8601, Clock};
use crate::store::{swallow, Lookup, ObjectCache, TabStorage};

/// Key of the validator map in both stores.
pub const CONDITIONAL_CACHE_KEY: &str = "tabsync:conditional-cache";

/// Default lifetime of the map in the object cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Everything remembered about one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalCacheEntry {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub etag: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_sync: Option<String>,
  /// Milliseconds since the epoch of the last write to this entry
  pub written_at: i64,
}

/// Validators to send with a conditional request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validator {
  pub etag: Option<String>,
  pub last_modified: Option<String>,
}

type EntryMap = BTreeMap<String, ConditionalCacheEntry>;

/// Validator store shared by all tabs through the underlying media.
pub struct ConditionalCache {
  objects: Arc<dyn ObjectCache>,
  fallback: TabStorage,
  clock: Arc<dyn Clock>,
  ttl: Duration,
  /// Serializes read-modify-write cycles issued from this tab
  write_lock: Mutex<()>,
}

impl ConditionalCache {
  pub fn new(objects: Arc<dyn ObjectCache>, fallback: TabStorage, clock: Arc<dyn Clock>) -> Self {
    Self {
      objects,
      fallback,
      clock,
      ttl: DEFAULT_CACHE_TTL,
      write_lock: Mutex::new(()),
    }
  }

  /// Set how long the map survives in the object cache.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Stored validator for the resource, if any was recorded.
  pub async fn get_validator(&self, resource: &str) -> Option<Validator> {
    let entry = self.entry(resource).await?;
    if entry.etag.is_none() && entry.last_modified.is_none() {
      return None;
    }
    Some(Validator {
      etag: entry.etag,
      last_modified: entry.last_modified,
    })
  }

  /// Merge the given validators into the resource's entry. Fields passed as
  /// `None` keep their previous value.
  pub async fn set_validator(
    &self,
    resource: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
  ) {
    self
      .update(resource, |entry| {
        if let Some(etag) = etag {
          entry.etag = Some(etag.to_string());
        }
        if let Some(last_modified) = last_modified {
          entry.last_modified = Some(last_modified.to_string());
        }
      })
      .await;
  }

  /// Forget everything about the resource.
  pub async fn clear_validator(&self, resource: &str) {
    let key = normalize_resource_key(resource);
    let _guard = self.write_lock.lock().await;
    let mut entries = self.load().await;
    if entries.remove(&key).is_some() {
      debug!(resource = %key, "cleared validator");
      self.store(&entries).await;
    }
  }

  /// Forget everything about every resource.
  pub async fn clear_all(&self) {
    let _guard = self.write_lock.lock().await;
    swallow(
      self.objects.delete(CONDITIONAL_CACHE_KEY).await,
      "clear conditional cache objects",
    );
    swallow(
      self.fallback.delete(CONDITIONAL_CACHE_KEY),
      "clear conditional cache fallback",
    );
  }

  /// When the resource was last synchronized (RFC 3339).
  pub async fn get_last_sync(&self, resource: &str) -> Option<String> {
    self.entry(resource).await?.last_sync
  }

  /// Record a synchronization; `None` means now.
  pub async fn set_last_sync(&self, resource: &str, iso: Option<&str>) {
    let iso = iso
      .map(String::from)
      .unwrap_or_else(|| to_iso8601(self.clock.now_ms()));
    self
      .update(resource, |entry| entry.last_sync = Some(iso))
      .await;
  }

  /// Whether a freshly received entity tag differs from the stored one.
  ///
  /// With no new tag there is nothing to compare, so the answer is `false`.
  /// With no stored tag the resource is treated as changed.
  pub async fn has_validator_changed(&self, resource: &str, new_etag: Option<&str>) -> bool {
    let Some(new_etag) = new_etag else {
      return false;
    };
    match self.get_validator(resource).await.and_then(|v| v.etag) {
      Some(stored) => stored != new_etag,
      None => true,
    }
  }

  /// Conditional headers (`If-None-Match`, `If-Modified-Since`) for a read.
  pub async fn conditional_headers(&self, resource: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(validator) = self.get_validator(resource).await else {
      return headers;
    };

    if let Some(value) = validator.etag.and_then(|v| HeaderValue::from_str(&v).ok()) {
      headers.insert(IF_NONE_MATCH, value);
    }
    if let Some(value) = validator
      .last_modified
      .and_then(|v| HeaderValue::from_str(&v).ok())
    {
      headers.insert(IF_MODIFIED_SINCE, value);
    }
    headers
  }

  /// Record the validators of a successful response and mark the resource
  /// as synchronized now.
  pub async fn record_response(&self, resource: &str, headers: &HeaderMap) {
    let header = |name: HeaderName| {
      headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    };
    let etag = header(ETAG);
    let last_modified = header(LAST_MODIFIED);
    let now = to_iso8601(self.clock.now_ms());

    self
      .update(resource, |entry| {
        if etag.is_some() {
          entry.etag = etag;
        }
        if last_modified.is_some() {
          entry.last_modified = last_modified;
        }
        entry.last_sync = Some(now);
      })
      .await;
  }

  async fn entry(&self, resource: &str) -> Option<ConditionalCacheEntry> {
    let key = normalize_resource_key(resource);
    self.load().await.remove(&key)
  }

  async fn update(&self, resource: &str, apply: impl FnOnce(&mut ConditionalCacheEntry)) {
    let key = normalize_resource_key(resource);
    let _guard = self.write_lock.lock().await;

    let mut entries = self.load().await;
    let entry = entries.entry(key).or_default();
    apply(entry);
    entry.written_at = self.clock.now_ms();

    self.store(&entries).await;
  }

  async fn load(&self) -> EntryMap {
    match self.objects.get(CONDITIONAL_CACHE_KEY).await {
      Lookup::Hit(value) => match serde_json::from_value::<EntryMap>(value) {
        Ok(entries) if !entries.is_empty() => return entries,
        Ok(_) => {}
        Err(e) => warn!(error = %e, "discarding unreadable conditional cache object"),
      },
      Lookup::Miss => {}
      Lookup::Failed(err) => warn!(error = %err, "object cache unavailable, using fallback"),
    }

    self
      .fallback
      .get(CONDITIONAL_CACHE_KEY)
      .into_option("read conditional cache fallback")
      .and_then(|raw| match serde_json::from_str::<EntryMap>(&raw) {
        Ok(entries) => Some(entries),
        Err(e) => {
          warn!(error = %e, "discarding unreadable conditional cache fallback");
          None
        }
      })
      .unwrap_or_default()
  }

  async fn store(&self, entries: &EntryMap) {
    let value = match serde_json::to_value(entries) {
      Ok(value) => value,
      Err(e) => {
        warn!(error = %e, "failed to encode conditional cache");
        return;
      }
    };

    swallow(
      self
        .objects
        .set(CONDITIONAL_CACHE_KEY, &value, self.ttl)
        .await,
      "write conditional cache objects",
    );
    swallow(
      self
        .fallback
        .set(CONDITIONAL_CACHE_KEY, &value.to_string()),
      "write conditional cache fallback",
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::{
    DurableStore, NoopStore, SqliteDurableStore, SqliteObjectCache, StorageArea, StoreError,
  };
  use async_trait::async_trait;
  use serde_json::Value;

  /// Object cache that is always unavailable.
  struct BrokenObjects;

  #[async_trait]
  impl ObjectCache for BrokenObjects {
    async fn get(&self, _key: &str) -> Lookup<Value> {
      Lookup::Failed(StoreError::new("object store disabled"))
    }

    async fn set(&self, _key: &str, _value: &Value, _ttl: Duration) -> Result<(), StoreError> {
      Err(StoreError::new("object store disabled"))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
      Err(StoreError::new("object store disabled"))
    }
  }

  /// Durable store that fails every call.
  struct BrokenStore;

  impl DurableStore for BrokenStore {
    fn get(&self, _key: &str) -> Lookup<String> {
      Lookup::Failed(StoreError::new("quota exceeded"))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
      Err(StoreError::new("quota exceeded"))
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
      Err(StoreError::new("quota exceeded"))
    }
  }

  fn cache_with(objects: Arc<dyn ObjectCache>, store: Arc<dyn DurableStore>) -> ConditionalCache {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    ConditionalCache::new(objects, StorageArea::new(store).for_tab("t"), clock)
  }

  fn healthy() -> ConditionalCache {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let objects = Arc::new(SqliteObjectCache::open_in_memory(clock.clone()).unwrap());
    let store = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
    ConditionalCache::new(objects, StorageArea::new(store).for_tab("t"), clock)
  }

  #[tokio::test]
  async fn test_set_and_get_validator() {
    let cache = healthy();
    assert_eq!(cache.get_validator("diseases").await, None);

    cache
      .set_validator("/api/v1/diseases?page=3", Some("\"abc\""), None)
      .await;
    let validator = cache.get_validator("diseases").await.unwrap();
    assert_eq!(validator.etag.as_deref(), Some("\"abc\""));
    assert_eq!(validator.last_modified, None);
  }

  #[tokio::test]
  async fn test_set_validator_merges() {
    let cache = healthy();
    cache.set_validator("diseases", Some("e1"), Some("Mon")).await;
    cache.set_validator("diseases", None, Some("Tue")).await;

    let validator = cache.get_validator("diseases").await.unwrap();
    assert_eq!(validator.etag.as_deref(), Some("e1"));
    assert_eq!(validator.last_modified.as_deref(), Some("Tue"));
  }

  #[tokio::test]
  async fn test_has_validator_changed() {
    let cache = healthy();
    assert!(!cache.has_validator_changed("diseases", None).await);
    assert!(cache.has_validator_changed("diseases", Some("abc")).await);

    cache.set_validator("diseases", Some("abc"), None).await;
    assert!(!cache.has_validator_changed("diseases", Some("abc")).await);
    assert!(cache.has_validator_changed("diseases", Some("def")).await);
    assert!(!cache.has_validator_changed("diseases", None).await);
  }

  #[tokio::test]
  async fn test_last_sync_is_independent_of_validators() {
    let cache = healthy();
    cache
      .set_last_sync("patients", Some("2024-05-01T10:00:00.000Z"))
      .await;

    assert_eq!(
      cache.get_last_sync("/api/v1/patients").await.as_deref(),
      Some("2024-05-01T10:00:00.000Z")
    );
    assert_eq!(cache.get_validator("patients").await, None);

    cache.set_last_sync("patients", None).await;
    assert_eq!(
      cache.get_last_sync("patients").await.as_deref(),
      Some("2023-11-14T22:13:20.000Z")
    );
  }

  #[tokio::test]
  async fn test_clear_validator_and_clear_all() {
    let cache = healthy();
    cache.set_validator("a", Some("1"), None).await;
    cache.set_validator("b", Some("2"), None).await;

    cache.clear_validator("/api/v1/a").await;
    assert_eq!(cache.get_validator("a").await, None);
    assert!(cache.get_validator("b").await.is_some());

    cache.clear_all().await;
    assert_eq!(cache.get_validator("b").await, None);
  }

  #[tokio::test]
  async fn test_falls_back_to_durable_store() {
    let store: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
    let cache = cache_with(Arc::new(BrokenObjects), store.clone());

    cache.set_validator("diseases", Some("abc"), None).await;
    assert_eq!(
      cache.get_validator("diseases").await.and_then(|v| v.etag),
      Some("abc".to_string())
    );
    assert!(matches!(store.get(CONDITIONAL_CACHE_KEY), Lookup::Hit(_)));
  }

  #[tokio::test]
  async fn test_written_at_is_refreshed() {
    let clock = Arc::new(ManualClock::new(10));
    let objects = Arc::new(SqliteObjectCache::open_in_memory(clock.clone()).unwrap());
    let store: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::open_in_memory().unwrap());
    let fallback = StorageArea::new(store.clone()).for_tab("t");
    let cache = ConditionalCache::new(objects, fallback, clock.clone());

    cache.set_validator("x", Some("1"), None).await;
    clock.advance(90);
    cache.set_last_sync("x", None).await;

    let raw = match store.get(CONDITIONAL_CACHE_KEY) {
      Lookup::Hit(raw) => raw,
      other => panic!("expected fallback copy, got {:?}", other),
    };
    let entries: EntryMap = serde_json::from_str(&raw).unwrap();
    assert_eq!(entries["x"].written_at, 100);
    assert_eq!(entries["x"].etag.as_deref(), Some("1"));
  }

  #[tokio::test]
  async fn test_unavailable_storage_degrades_to_miss() {
    let cache = cache_with(Arc::new(BrokenObjects), Arc::new(BrokenStore));
    cache.set_validator("diseases", Some("abc"), None).await;
    assert_eq!(cache.get_validator("diseases").await, None);
    assert!(cache.has_validator_changed("diseases", Some("abc")).await);

    let cache = cache_with(Arc::new(BrokenObjects), Arc::new(NoopStore));
    assert_eq!(cache.get_last_sync("diseases").await, None);
  }

  #[tokio::test]
  async fn test_conditional_headers_round_trip() {
    let cache = healthy();
    assert!(cache.conditional_headers("diseases").await.is_empty());

    let mut response = HeaderMap::new();
    response.insert(ETAG, HeaderValue::from_static("W/\"42\""));
    response.insert(
      LAST_MODIFIED,
      HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    cache.record_response("/api/v1/diseases", &response).await;

    let headers = cache.conditional_headers("diseases?page=2").await;
    assert_eq!(headers.get(IF_NONE_MATCH).unwrap(), "W/\"42\"");
    assert_eq!(
      headers.get(IF_MODIFIED_SINCE).unwrap(),
      "Wed, 21 Oct 2015 07:28:00 GMT"
    );
    assert!(cache.get_last_sync("diseases").await.is_some());
  }
}
