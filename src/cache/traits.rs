//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long any cached record stays valid.
pub fn cache_validity() -> Duration {
  Duration::days(14)
}

/// True while a record cached at `cached_at` is still inside the validity window.
pub fn is_valid(cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
  now - cached_at < cache_validity()
}

/// A cached payload stamped with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub data: T,
  pub cached_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, cached_at: DateTime<Utc>) -> Self {
    Self { data, cached_at }
  }

  pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
    is_valid(self.cached_at, now)
  }
}

/// Bulk list snapshot (offline products, offline categories).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRecord<T> {
  pub data: Vec<T>,
  pub timestamp: DateTime<Utc>,
}

/// Result from a read-through lookup, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Network unavailable or failed, serving cached data
  Offline,
}
