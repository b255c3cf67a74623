//! Storage measurement and expiry sweeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::event::SyncStatus;
use crate::store::{keys, DurableStore, StorageEstimate};

use super::traits::{is_valid, BulkRecord};

/// Usage ratio above which a refresh triggers an expiry sweep.
const PRESSURE_RATIO: f64 = 0.9;

/// Any umbrella-map entry carrying a `cachedAt` stamp.
#[derive(Debug, Serialize, Deserialize)]
struct StampedEntry {
  #[serde(rename = "cachedAt")]
  cached_at: DateTime<Utc>,
  #[serde(flatten)]
  rest: Map<String, Value>,
}

const SWEPT_MAPS: [&str; 3] = [keys::DATA_CACHE, keys::PRODUCT_DETAILS, keys::IMAGE_CACHE];
const SWEPT_BULK: [&str; 2] = [keys::OFFLINE_PRODUCTS, keys::OFFLINE_CATEGORIES];

pub struct StorageQuotaManager {
  store: Arc<DurableStore>,
  clock: Arc<dyn Clock>,
  status: SyncStatus,
}

impl StorageQuotaManager {
  pub fn new(store: Arc<DurableStore>, clock: Arc<dyn Clock>, status: SyncStatus) -> Self {
    Self {
      store,
      clock,
      status,
    }
  }

  /// Refresh the storage estimate. No-op when the backend can't measure itself.
  ///
  /// Under quota pressure this also runs an expiry sweep.
  pub fn update_storage_usage(&self) -> Option<StorageEstimate> {
    let estimate = self.store.estimate()?;
    self.status.set_storage(estimate);

    if estimate.usage_ratio().is_some_and(|r| r > PRESSURE_RATIO) {
      info!(used = estimate.used, quota = ?estimate.quota, "storage under pressure");
      self.clear_expired_cache();
      return self.store.estimate().inspect(|e| self.status.set_storage(*e));
    }
    Some(estimate)
  }

  /// Remove every cached record older than the validity window.
  ///
  /// Returns the number of entries removed.
  pub fn clear_expired_cache(&self) -> usize {
    let now = self.clock.now();
    let mut removed = 0;

    for name in SWEPT_MAPS {
      self
        .store
        .update::<BTreeMap<String, StampedEntry>, _>(name, |entries| {
          let before = entries.len();
          entries.retain(|_, entry| is_valid(entry.cached_at, now));
          removed += before - entries.len();
          before != entries.len()
        });
    }

    for name in SWEPT_BULK {
      if let Some(record) = self.store.get_json::<BulkRecord<Value>>(name) {
        if !is_valid(record.timestamp, now) {
          self.store.remove(name);
          removed += 1;
        }
      }
    }

    debug!(removed, "expired cache sweep finished");
    removed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheEntry;
  use crate::testing::{ManualClock, MemoryBackend};
  use chrono::Duration;
  use serde_json::json;

  fn manager(backend: Arc<MemoryBackend>) -> (Arc<ManualClock>, Arc<DurableStore>, StorageQuotaManager) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(DurableStore::new(backend));
    let quota = StorageQuotaManager::new(store.clone(), clock.clone(), SyncStatus::new());
    (clock, store, quota)
  }

  #[test]
  fn test_sweep_removes_only_expired_entries() {
    let (clock, store, quota) = manager(Arc::new(MemoryBackend::new()));
    let now = clock.now();

    let mut data = BTreeMap::new();
    data.insert("old", CacheEntry::new(json!(1), now - Duration::days(15)));
    data.insert("new", CacheEntry::new(json!(2), now - Duration::days(1)));
    store.set_json(keys::DATA_CACHE, &data);

    let images = json!({
      "https://cdn/a.jpg": {"encoded": "data:image/png;base64,AA==", "cachedAt": now - Duration::days(20)},
    });
    store.set_json(keys::IMAGE_CACHE, &images);

    store.set_json(
      keys::OFFLINE_PRODUCTS,
      &BulkRecord {
        data: vec![json!({"id": "p1"})],
        timestamp: now - Duration::days(14),
      },
    );

    assert_eq!(quota.clear_expired_cache(), 3);

    let data: BTreeMap<String, CacheEntry<Value>> = store.get_json(keys::DATA_CACHE).unwrap();
    assert_eq!(data.keys().collect::<Vec<_>>(), vec!["new"]);
    let images: BTreeMap<String, Value> = store.get_json(keys::IMAGE_CACHE).unwrap();
    assert!(images.is_empty());
    assert_eq!(store.get(keys::OFFLINE_PRODUCTS), None);
  }

  #[test]
  fn test_sweep_preserves_entry_fields() {
    let (clock, store, quota) = manager(Arc::new(MemoryBackend::new()));
    let images = json!({
      "https://cdn/a.jpg": {"encoded": "data:image/png;base64,AA==", "cachedAt": clock.now()},
      "https://cdn/b.jpg": {"encoded": "data:image/png;base64,AQ==", "cachedAt": clock.now() - Duration::days(30)},
    });
    store.set_json(keys::IMAGE_CACHE, &images);

    assert_eq!(quota.clear_expired_cache(), 1);

    let images: BTreeMap<String, Value> = store.get_json(keys::IMAGE_CACHE).unwrap();
    assert_eq!(
      images["https://cdn/a.jpg"]["encoded"],
      json!("data:image/png;base64,AA==")
    );
  }

  #[test]
  fn test_usage_pressure_triggers_sweep() {
    let backend = Arc::new(MemoryBackend::with_quota(400));
    let (clock, store, quota) = manager(backend);
    let mut data = BTreeMap::new();
    data.insert(
      "stale".to_string(),
      CacheEntry::new("x".repeat(300), clock.now() - Duration::days(30)),
    );
    store.set_json(keys::DATA_CACHE, &data);

    let estimate = quota.update_storage_usage().unwrap();
    assert!(estimate.used < 100);
    assert_eq!(quota.status.snapshot().storage, Some(estimate));
  }

  #[test]
  fn test_usage_is_noop_without_estimate() {
    let store = Arc::new(DurableStore::new(Arc::new(crate::store::NoopBackend)));
    let status = SyncStatus::new();
    let quota = StorageQuotaManager::new(store, Arc::new(ManualClock::default()), status.clone());

    assert_eq!(quota.update_storage_usage(), None);
    assert_eq!(status.snapshot().storage, None);
  }
}
