//! TTL-keyed store layered over a durable [`Storage`] backend.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::Storage;
use crate::clock::Clock;

/// TTL applied when a caller does not pick one.
pub const DEFAULT_TTL_MINUTES: u32 = 5;

const MS_PER_MINUTE: i64 = 60 * 1000;

/// On-disk row format: `{"value": ..., "expiry": <epoch-ms>}`.
#[derive(Debug, Serialize, Deserialize)]
struct StoredItem<T> {
  value: T,
  expiry: i64,
}

/// A decoded entry together with its expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub value: T,
  pub expires_at: i64,
}

impl<T> CacheEntry<T> {
  pub fn is_stale(&self, now_ms: i64) -> bool {
    now_ms > self.expires_at
  }
}

/// Key/value store with per-entry expiry.
///
/// Storage failures never reach the caller: a failed write shows up as a
/// cache miss on the next read.
#[derive(Clone)]
pub struct TtlStore {
  storage: Arc<dyn Storage>,
  clock: Arc<dyn Clock>,
}

impl TtlStore {
  pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
    Self { storage, clock }
  }

  pub fn storage(&self) -> &Arc<dyn Storage> {
    &self.storage
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  /// Store `value` under `key` for `ttl_minutes` (minimum one minute).
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_minutes: u32) {
    let ttl = i64::from(ttl_minutes.max(1)) * MS_PER_MINUTE;
    let item = StoredItem {
      value,
      expiry: self.clock.now_ms() + ttl,
    };

    let text = match serde_json::to_string(&item) {
      Ok(text) => text,
      Err(e) => {
        warn!(key, error = %e, "cache value not serializable, skipping write");
        return;
      }
    };

    if let Err(e) = self.storage.set_item(key, &text) {
      warn!(key, error = %e, "cache write dropped");
    }
  }

  /// Fresh value for `key`. Expired entries are evicted and read as absent.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.entry::<T>(key)?;

    if entry.is_stale(self.clock.now_ms()) {
      debug!(key, "cache entry expired, evicting");
      self.remove(key);
      return None;
    }

    Some(entry.value)
  }

  /// Value for `key` regardless of expiry.
  pub fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.entry(key).map(|entry| entry.value)
  }

  /// Raw entry with its expiry, without evicting anything.
  pub fn entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let text = match self.storage.get_item(key) {
      Ok(Some(text)) => text,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    match serde_json::from_str::<StoredItem<T>>(&text) {
      Ok(item) => Some(CacheEntry {
        value: item.value,
        expires_at: item.expiry,
      }),
      Err(e) => {
        debug!(key, error = %e, "undecodable cache row");
        None
      }
    }
  }

  /// Invalidate a single key.
  pub fn remove(&self, key: &str) {
    if let Err(e) = self.storage.remove_item(key) {
      warn!(key, error = %e, "cache eviction failed");
    }
  }

  /// Remove every key starting with `prefix`, or everything when `None`.
  pub fn clear(&self, prefix: Option<&str>) {
    let Some(prefix) = prefix else {
      if let Err(e) = self.storage.clear() {
        warn!(error = %e, "cache clear failed");
      }
      return;
    };

    for key in self.keys() {
      if key.starts_with(prefix) {
        self.remove(&key);
      }
    }
  }

  pub fn keys(&self) -> Vec<String> {
    self.storage.keys().unwrap_or_else(|e| {
      warn!(error = %e, "cache key listing failed");
      Vec::new()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::clock::ManualClock;
  use serde_json::{json, Value};

  fn store() -> (TtlStore, Arc<ManualClock>, Arc<MemoryStorage>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let storage = Arc::new(MemoryStorage::new());
    let store = TtlStore::new(storage.clone(), clock.clone());
    (store, clock, storage)
  }

  #[test]
  fn test_unknown_key_is_absent() {
    let (store, _, _) = store();
    assert_eq!(store.get::<Value>("never"), None);
    assert_eq!(store.get_stale::<Value>("never"), None);
  }

  #[test]
  fn test_value_readable_until_ttl_elapses() {
    let (store, clock, _) = store();
    store.set("k", &json!([1, 2]), 5);

    clock.advance_minutes(5);
    assert_eq!(store.get::<Value>("k"), Some(json!([1, 2])));

    clock.advance_ms(1);
    assert_eq!(store.get_stale::<Value>("k"), Some(json!([1, 2])));
    assert_eq!(store.get::<Value>("k"), None);
  }

  #[test]
  fn test_expired_get_evicts_row() {
    let (store, clock, storage) = store();
    store.set("k", &"v", 1);
    clock.advance_minutes(2);

    assert_eq!(store.get::<String>("k"), None);
    assert_eq!(storage.get_item("k").unwrap(), None);
    assert_eq!(store.get_stale::<String>("k"), None);
  }

  #[test]
  fn test_stale_value_survives_without_strict_read() {
    let (store, clock, _) = store();
    store.set("k", &"v", 1);
    clock.advance_minutes(30);

    assert_eq!(store.get_stale::<String>("k").as_deref(), Some("v"));
    assert_eq!(store.get_stale::<String>("k").as_deref(), Some("v"));
  }

  #[test]
  fn test_clear_prefix_leaves_other_keys() {
    let (store, _, _) = store();
    store.set("listA", &1, 5);
    store.set("listB", &2, 5);
    store.set("other", &3, 5);

    store.clear(Some("list"));

    assert_eq!(store.keys(), vec!["other"]);
    assert_eq!(store.get::<i32>("other"), Some(3));
  }

  #[test]
  fn test_clear_all() {
    let (store, _, _) = store();
    store.set("a", &1, 5);
    store.set("b", &2, 5);
    store.clear(None);
    assert!(store.keys().is_empty());
  }

  #[test]
  fn test_row_format() {
    let (store, clock, storage) = store();
    store.set("k", &json!({"id": 1}), 60);

    let raw: Value = serde_json::from_str(&storage.get_item("k").unwrap().unwrap()).unwrap();
    assert_eq!(raw["value"], json!({"id": 1}));
    assert_eq!(raw["expiry"], json!(clock.now_ms() + 60 * 60_000));
  }

  #[test]
  fn test_zero_ttl_still_expires_after_creation() {
    let (store, clock, _) = store();
    store.set("k", &1, 0);
    let entry = store.entry::<i32>("k").unwrap();
    assert!(entry.expires_at > clock.now_ms());
  }

  #[test]
  fn test_quota_failure_is_a_silent_miss() {
    let clock = Arc::new(ManualClock::new(0));
    let store = TtlStore::new(Arc::new(MemoryStorage::with_quota(16)), clock);

    store.set("big", &"x".repeat(100), 5);
    assert_eq!(store.get::<String>("big"), None);
  }

  #[test]
  fn test_garbage_row_reads_as_absent() {
    let (store, _, storage) = store();
    storage.set_item("k", "not json").unwrap();
    assert_eq!(store.get::<Value>("k"), None);
    assert_eq!(store.get_stale::<Value>("k"), None);
  }
}
