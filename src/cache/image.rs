//! Two-tier image cache.
//!
//! Tiers are tried in order on both read and write:
//! 1. `BlobTier` - raw bodies on disk, read back as `file://` references
//! 2. `EncodedTier` - data URIs inside the durable store
//!
//! A URL in neither tier resolves to itself, so an offline caller just gets a
//! broken image instead of an error.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::event::SyncStatus;
use crate::remote::{FetchedResource, ResourceFetcher};
use crate::store::{keys, DurableStore};

use super::quota::StorageQuotaManager;
use super::traits::is_valid;

/// Hard limit on a single image download.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Linear backoff unit between attempts.
pub const RETRY_DELAY_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_RETRIES: u32 = 3;
/// Images downloaded concurrently during bulk prefetch.
pub const PREFETCH_BATCH: usize = 3;

/// Fallback-tier record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheEntry {
  pub encoded: String,
  pub cached_at: DateTime<Utc>,
}

/// One storage mechanism in the image fallback chain.
pub trait ImageTier: Send + Sync {
  fn name(&self) -> &'static str;

  /// Locally resolvable reference for `url`, if this tier holds it.
  fn get(&self, url: &str) -> Option<String>;

  /// Store the resource. Returns false when the tier couldn't take it.
  fn put(&self, url: &str, resource: &FetchedResource) -> bool;

  /// Whether an expiry sweep can make room in this tier.
  fn sweepable(&self) -> bool {
    false
  }
}

/// Raw response bodies on disk, one file per URL.
///
/// Eviction is left to whoever manages the directory; there are no timestamps.
pub struct BlobTier {
  dir: PathBuf,
  max_bytes: Option<u64>,
}

impl BlobTier {
  pub fn new(dir: impl Into<PathBuf>, max_bytes: Option<u64>) -> Self {
    Self {
      dir: dir.into(),
      max_bytes,
    }
  }

  fn path_for(&self, url: &str) -> PathBuf {
    // SHA256 hash for stable, filesystem-safe names
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    self.dir.join(hex::encode(hasher.finalize()))
  }

  fn used_bytes(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
      .map(|entries| {
        entries
          .filter_map(|e| e.ok())
          .filter_map(|e| e.metadata().ok())
          .filter(|m| m.is_file())
          .map(|m| m.len())
          .sum()
      })
      .unwrap_or(0)
  }

  fn write(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(&self.dir)?;
    // Write-then-rename so readers never see a partial body
    let tmp = path.with_extension("part");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
  }
}

impl ImageTier for BlobTier {
  fn name(&self) -> &'static str {
    "blob"
  }

  fn get(&self, url: &str) -> Option<String> {
    let path = self.path_for(url);
    if !path.is_file() {
      return None;
    }
    let path = path.canonicalize().ok()?;
    Url::from_file_path(&path).ok().map(String::from)
  }

  fn put(&self, url: &str, resource: &FetchedResource) -> bool {
    if let Some(max) = self.max_bytes {
      if Self::used_bytes(&self.dir) + resource.bytes.len() as u64 > max {
        debug!(url, "blob tier full");
        return false;
      }
    }

    match self.write(&self.path_for(url), &resource.bytes) {
      Ok(()) => true,
      Err(e) => {
        debug!(url, "blob tier write failed: {}", e);
        false
      }
    }
  }
}

/// Data URIs in a single umbrella record of the durable store.
pub struct EncodedTier {
  store: Arc<DurableStore>,
  clock: Arc<dyn Clock>,
}

impl EncodedTier {
  pub fn new(store: Arc<DurableStore>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }
}

/// `data:{type};base64,{body}`
pub fn data_uri(resource: &FetchedResource) -> String {
  format!(
    "data:{};base64,{}",
    resource.content_type,
    STANDARD.encode(&resource.bytes)
  )
}

type ImageMap = BTreeMap<String, ImageCacheEntry>;

impl ImageTier for EncodedTier {
  fn name(&self) -> &'static str {
    "encoded"
  }

  fn get(&self, url: &str) -> Option<String> {
    let entry = self
      .store
      .get_json::<ImageMap>(keys::IMAGE_CACHE)?
      .remove(url)?;

    if is_valid(entry.cached_at, self.clock.now()) {
      return Some(entry.encoded);
    }

    // Expired: drop it so the next put isn't shadowed
    self
      .store
      .update::<ImageMap, _>(keys::IMAGE_CACHE, |map| map.remove(url).is_some());
    None
  }

  fn put(&self, url: &str, resource: &FetchedResource) -> bool {
    let entry = ImageCacheEntry {
      encoded: data_uri(resource),
      cached_at: self.clock.now(),
    };
    self.store.update::<ImageMap, _>(keys::IMAGE_CACHE, |map| {
      map.insert(url.to_string(), entry);
      true
    })
  }

  fn sweepable(&self) -> bool {
    true
  }
}

pub struct ImageCache {
  tiers: Vec<Arc<dyn ImageTier>>,
  fetcher: Arc<dyn ResourceFetcher>,
  quota: Arc<StorageQuotaManager>,
  status: SyncStatus,
}

impl ImageCache {
  /// `tiers` are in preference order.
  pub fn new(
    tiers: Vec<Arc<dyn ImageTier>>,
    fetcher: Arc<dyn ResourceFetcher>,
    quota: Arc<StorageQuotaManager>,
    status: SyncStatus,
  ) -> Self {
    Self {
      tiers,
      fetcher,
      quota,
      status,
    }
  }

  /// Best local reference for `url`, or `url` itself on a miss.
  pub fn get_cached_image(&self, url: &str) -> String {
    self.lookup(url).unwrap_or_else(|| url.to_string())
  }

  fn lookup(&self, url: &str) -> Option<String> {
    self.tiers.iter().find_map(|tier| tier.get(url))
  }

  /// Make `url` available offline. Returns false once `retries` attempts fail.
  pub async fn cache_image(&self, url: &str, retries: u32) -> bool {
    if self.lookup(url).is_some() {
      return true;
    }

    for attempt in 0..retries {
      if self.try_cache(url).await {
        return true;
      }
      if attempt + 1 < retries {
        tokio::time::sleep(RETRY_DELAY_BASE * (attempt + 1)).await;
      }
    }

    warn!(url, retries, "image not cached");
    false
  }

  async fn try_cache(&self, url: &str) -> bool {
    let resource = match tokio::time::timeout(FETCH_TIMEOUT, self.fetcher.fetch(url)).await {
      Ok(Ok(resource)) => resource,
      Ok(Err(e)) => {
        debug!(url, "image fetch failed: {}", e);
        return false;
      }
      Err(_) => {
        debug!(url, "image fetch timed out");
        return false;
      }
    };

    for tier in &self.tiers {
      if tier.put(url, &resource) {
        debug!(url, tier = tier.name(), "image cached");
        return true;
      }
      if tier.sweepable() {
        self.quota.clear_expired_cache();
        if tier.put(url, &resource) {
          debug!(url, tier = tier.name(), "image cached after sweep");
          return true;
        }
      }
    }
    false
  }

  /// Cache `urls` in batches of `PREFETCH_BATCH`, tolerating failures.
  ///
  /// With `report_progress`, `cache_progress` advances after each batch and
  /// resets to `{0, 0}` at the end. Returns how many images are now cached.
  pub async fn prefetch(&self, urls: &[String], report_progress: bool) -> usize {
    let total = urls.len();
    if report_progress {
      self.status.set_progress(0, total);
    }

    let mut cached = 0;
    let mut done = 0;
    for batch in urls.chunks(PREFETCH_BATCH) {
      let results = join_all(batch.iter().map(|url| self.cache_image(url, DEFAULT_RETRIES))).await;
      cached += results.into_iter().filter(|ok| *ok).count();
      done += batch.len();
      if report_progress {
        self.status.set_progress(done, total);
      }
    }

    if report_progress {
      self.status.set_progress(0, 0);
    }
    cached
  }
}
