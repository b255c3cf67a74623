//! Fail-soft adapter over a key-value backend.
//!
//! Every operation here swallows backend errors: reads miss, writes report
//! `false`, removals are fire-and-forget. Callers treat writes as best-effort;
//! a failed write only costs offline availability, never correctness.
//! Read-modify-write paths use the `try_` reads instead, so a failed read is
//! never mistaken for an absent record and written back over it.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::backend::{KeyValueBackend, StorageEstimate};

/// Namespace shared by every key this engine writes.
pub const STORAGE_PREFIX: &str = "shopsync";
/// Current storage format. Keys under any other version are garbage.
pub const STORAGE_VERSION: &str = "v2";

/// Logical record names.
pub mod keys {
  pub const PENDING_ACTIONS: &str = "pending_actions";
  pub const DATA_CACHE: &str = "data_cache";
  pub const OFFLINE_PRODUCTS: &str = "offline_products";
  pub const OFFLINE_CATEGORIES: &str = "offline_categories";
  pub const PRODUCT_DETAILS: &str = "product_details";
  pub const IMAGE_CACHE: &str = "image_cache";
  pub const LAST_SYNC: &str = "last_sync";
}

pub struct DurableStore {
  backend: Arc<dyn KeyValueBackend>,
  /// Serializes read-modify-write of umbrella records
  write_lock: Mutex<()>,
}

impl DurableStore {
  pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
    Self {
      backend,
      write_lock: Mutex::new(()),
    }
  }

  /// Physical key for a logical record name.
  pub fn key(name: &str) -> String {
    format!("{}:{}:{}", STORAGE_PREFIX, STORAGE_VERSION, name)
  }

  pub fn get(&self, name: &str) -> Option<String> {
    match self.try_get(name) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = name, "storage read failed: {}", e);
        None
      }
    }
  }

  /// Read a record, keeping a backend failure distinct from a miss.
  pub fn try_get(&self, name: &str) -> Result<Option<String>> {
    self.backend.get(&Self::key(name))
  }

  /// Write a record. On failure, purge old-format keys and retry once.
  pub fn set(&self, name: &str, value: &str) -> bool {
    let key = Self::key(name);
    let err = match self.backend.set(&key, value) {
      Ok(()) => return true,
      Err(e) => e,
    };

    warn!(key = name, "storage write failed, purging stale versions: {}", err);
    self.purge_stale_versions();

    match self.backend.set(&key, value) {
      Ok(()) => true,
      Err(e) => {
        warn!(key = name, "storage write abandoned: {}", e);
        false
      }
    }
  }

  pub fn remove(&self, name: &str) {
    if let Err(e) = self.backend.remove(&Self::key(name)) {
      warn!(key = name, "storage remove failed: {}", e);
    }
  }

  /// Read and decode a JSON record. A record that doesn't decode is deleted.
  pub fn get_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
    match self.try_get_json(name) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = name, "storage read failed: {}", e);
        None
      }
    }
  }

  /// Like [`get_json`](Self::get_json), but a failed read is an error.
  ///
  /// Malformed records are still deleted and reported as absent.
  pub fn try_get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
    let Some(raw) = self.try_get(name)? else {
      return Ok(None);
    };
    match serde_json::from_str(&raw) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        warn!(key = name, "dropping malformed record: {}", e);
        self.remove(name);
        Ok(None)
      }
    }
  }

  pub fn set_json<T: Serialize>(&self, name: &str, value: &T) -> bool {
    match serde_json::to_string(value) {
      Ok(raw) => self.set(name, &raw),
      Err(e) => {
        warn!(key = name, "failed to encode record: {}", e);
        false
      }
    }
  }

  /// Read-modify-write an umbrella record under the store's write lock.
  ///
  /// `f` returns whether it changed anything; unchanged records are not
  /// rewritten. Returns false when the read or a needed write failed; a
  /// failed read leaves the stored record untouched.
  pub fn update<T, F>(&self, name: &str, f: F) -> bool
  where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> bool,
  {
    let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut record: T = match self.try_get_json(name) {
      Ok(record) => record.unwrap_or_default(),
      Err(e) => {
        warn!(key = name, "storage read failed, update abandoned: {}", e);
        return false;
      }
    };
    if !f(&mut record) {
      return true;
    }
    self.set_json(name, &record)
  }

  /// Remove every namespaced key that belongs to a different format version.
  pub fn purge_stale_versions(&self) -> usize {
    let keys = match self.backend.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!("failed to list storage keys: {}", e);
        return 0;
      }
    };

    let current = format!("{}:{}:", STORAGE_PREFIX, STORAGE_VERSION);
    let namespace = format!("{}:", STORAGE_PREFIX);
    let mut purged = 0;
    for key in keys {
      let stale = key.starts_with(&namespace) && !key.starts_with(&current);
      if stale && self.backend.remove(&key).is_ok() {
        purged += 1;
      }
    }

    debug!(purged, "purged stale storage versions");
    purged
  }

  pub fn estimate(&self) -> Option<StorageEstimate> {
    self.backend.estimate()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::NoopBackend;
  use crate::testing::MemoryBackend;
  use std::collections::BTreeMap;

  fn memory_store() -> (Arc<MemoryBackend>, DurableStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = DurableStore::new(backend.clone());
    (backend, store)
  }

  #[test]
  fn test_keys_are_versioned() {
    assert_eq!(DurableStore::key("last_sync"), "shopsync:v2:last_sync");
  }

  #[test]
  fn test_failed_write_purges_old_versions_and_retries() {
    let (backend, store) = memory_store();
    backend.set("shopsync:v1:pending_actions", "[]").unwrap();
    backend.set("unrelated", "keep").unwrap();
    backend.fail_next_writes(1);

    assert!(store.set("last_sync", "now"));
    assert_eq!(backend.get("shopsync:v1:pending_actions").unwrap(), None);
    assert_eq!(backend.get("unrelated").unwrap().as_deref(), Some("keep"));
    assert_eq!(store.get("last_sync").as_deref(), Some("now"));
  }

  #[test]
  fn test_write_gives_up_after_one_retry() {
    let (backend, store) = memory_store();
    backend.fail_next_writes(2);
    assert!(!store.set("last_sync", "now"));
    assert_eq!(store.get("last_sync"), None);
  }

  #[test]
  fn test_malformed_record_is_deleted() {
    let (_backend, store) = memory_store();
    store.set("data_cache", "{not json");

    let decoded: Option<BTreeMap<String, String>> = store.get_json("data_cache");
    assert!(decoded.is_none());
    assert_eq!(store.get("data_cache"), None);
  }

  #[test]
  fn test_update_skips_write_when_unchanged() {
    let (backend, store) = memory_store();
    assert!(store.update::<BTreeMap<String, u32>, _>("data_cache", |_| false));
    assert!(backend.keys().unwrap().is_empty());

    assert!(store.update::<BTreeMap<String, u32>, _>("data_cache", |m| {
      m.insert("a".into(), 1);
      true
    }));
    let map: BTreeMap<String, u32> = store.get_json("data_cache").unwrap();
    assert_eq!(map.get("a"), Some(&1));
  }

  #[test]
  fn test_update_keeps_record_when_read_fails() {
    let (backend, store) = memory_store();
    let entries = (0..50)
      .map(|i| (format!("k{}", i), i))
      .collect::<BTreeMap<String, u32>>();
    store.set_json("image_cache", &entries);

    backend.fail_next_reads(1);
    assert!(!store.update::<BTreeMap<String, u32>, _>("image_cache", |m| {
      m.insert("new".into(), 99);
      true
    }));
    let map: BTreeMap<String, u32> = store.get_json("image_cache").unwrap();
    assert_eq!(map, entries);

    assert!(store.update::<BTreeMap<String, u32>, _>("image_cache", |m| {
      m.insert("new".into(), 99);
      true
    }));
    let map: BTreeMap<String, u32> = store.get_json("image_cache").unwrap();
    assert_eq!(map.len(), 51);
  }

  #[test]
  fn test_try_get_separates_failure_from_miss() {
    let (backend, store) = memory_store();
    assert_eq!(store.try_get("last_sync").unwrap(), None);

    backend.fail_next_reads(1);
    assert!(store.try_get("last_sync").is_err());
  }

  #[test]
  fn test_noop_backend_never_errors_out() {
    let store = DurableStore::new(Arc::new(NoopBackend));
    assert!(!store.set("last_sync", "now"));
    assert_eq!(store.get("last_sync"), None);
    store.remove("last_sync");
    assert_eq!(store.estimate(), None);
  }
}
