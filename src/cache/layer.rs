//! Cache layer that orchestrates offline caching around the data service.
//!
//! Caching here is a side channel: remote failures are logged and swallowed so
//! they never block or fail the caller's primary online read.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::event::SyncStatus;
use crate::remote::{Category, DataService, Product};
use crate::store::{keys, DurableStore};

use super::image::ImageCache;
use super::quota::StorageQuotaManager;
use super::traits::{is_valid, BulkRecord, CacheEntry, CacheResult};

/// Products fetched for the offline catalog.
pub const BULK_LIMIT: usize = 150;
pub const IMAGES_PER_PRODUCT: usize = 3;
/// Same-category products warmed when a detail page is viewed.
pub const RELATED_LIMIT: usize = 20;
pub const RELATED_IMAGES_PER_PRODUCT: usize = 2;
pub const RELATED_IMAGE_CAP: usize = 20;

type DataMap = BTreeMap<String, CacheEntry<Value>>;
type DetailMap = BTreeMap<String, CacheEntry<Product>>;

/// What a bulk offline caching run stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineCacheReport {
  pub products: usize,
  pub categories: usize,
  pub images: usize,
}

pub struct CacheLayer {
  store: Arc<DurableStore>,
  clock: Arc<dyn Clock>,
  remote: Arc<dyn DataService>,
  images: Arc<ImageCache>,
  quota: Arc<StorageQuotaManager>,
  status: SyncStatus,
}

impl CacheLayer {
  pub fn new(
    store: Arc<DurableStore>,
    clock: Arc<dyn Clock>,
    remote: Arc<dyn DataService>,
    images: Arc<ImageCache>,
    quota: Arc<StorageQuotaManager>,
    status: SyncStatus,
  ) -> Self {
    Self {
      store,
      clock,
      remote,
      images,
      quota,
      status,
    }
  }

  // ==========================================================================
  // Generic keyed cache
  // ==========================================================================

  /// Store `data` under `key` in the shared data record.
  pub fn cache_data<T: Serialize>(&self, key: &str, data: &T) -> bool {
    let value = match serde_json::to_value(data) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, "failed to encode cache data: {}", e);
        return false;
      }
    };
    let entry = CacheEntry::new(value, self.clock.now());
    self.store.update::<DataMap, _>(keys::DATA_CACHE, |map| {
      map.insert(key.to_string(), entry);
      true
    })
  }

  /// Cached data for `key`. The validity window is NOT checked here.
  pub fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self
      .store
      .get_json::<DataMap>(keys::DATA_CACHE)?
      .remove(key)?;
    serde_json::from_value(entry.data).ok()
  }

  // ==========================================================================
  // Offline catalog
  // ==========================================================================

  fn valid_bulk<T: DeserializeOwned>(&self, name: &str) -> Option<BulkRecord<T>> {
    let record: BulkRecord<T> = self.store.get_json(name)?;
    if is_valid(record.timestamp, self.clock.now()) {
      return Some(record);
    }
    debug!(key = name, "offline record expired");
    self.store.remove(name);
    None
  }

  fn store_bulk<T: Serialize>(&self, name: &str, data: &[T]) -> bool {
    let record = BulkRecord {
      data: data.iter().collect::<Vec<_>>(),
      timestamp: self.clock.now(),
    };
    self.store.set_json(name, &record)
  }

  pub fn get_offline_products(&self) -> Option<Vec<Product>> {
    self.valid_bulk(keys::OFFLINE_PRODUCTS).map(|r| r.data)
  }

  pub fn get_offline_categories(&self) -> Option<Vec<Category>> {
    self.valid_bulk(keys::OFFLINE_CATEGORIES).map(|r| r.data)
  }

  /// Refresh the offline catalog, optionally downloading product images.
  pub async fn cache_products_for_offline(&self, include_images: bool) -> OfflineCacheReport {
    let mut report = OfflineCacheReport::default();
    self.quota.clear_expired_cache();
    self.quota.update_storage_usage();

    let products = match self.remote.fetch_products(BULK_LIMIT, 0).await {
      Ok(products) => products,
      Err(e) => {
        warn!("offline catalog refresh failed: {}", e);
        return report;
      }
    };
    if self.store_bulk(keys::OFFLINE_PRODUCTS, &products) {
      report.products = products.len();
    }

    match self.remote.fetch_categories().await {
      Ok(categories) => {
        if self.store_bulk(keys::OFFLINE_CATEGORIES, &categories) {
          report.categories = categories.len();
        }
      }
      Err(e) => warn!("offline category refresh failed: {}", e),
    }

    if include_images {
      let urls = collect_image_urls(&products, IMAGES_PER_PRODUCT, usize::MAX);
      report.images = self.images.prefetch(&urls, true).await;
    }

    self.quota.update_storage_usage();
    info!(
      products = report.products,
      categories = report.categories,
      images = report.images,
      "offline catalog refreshed"
    );
    report
  }

  // ==========================================================================
  // Product details
  // ==========================================================================

  pub fn cache_product_detail(&self, product: &Product) -> bool {
    let entry = CacheEntry::new(product.clone(), self.clock.now());
    self.store.update::<DetailMap, _>(keys::PRODUCT_DETAILS, |map| {
      map.insert(product.id.clone(), entry);
      true
    })
  }

  pub fn get_cached_product_detail(&self, id: &str) -> Option<Product> {
    self.valid_detail(id).map(|entry| entry.data)
  }

  fn valid_detail(&self, id: &str) -> Option<CacheEntry<Product>> {
    let entry = self
      .store
      .get_json::<DetailMap>(keys::PRODUCT_DETAILS)?
      .remove(id)?;
    if entry.is_valid(self.clock.now()) {
      return Some(entry);
    }

    self
      .store
      .update::<DetailMap, _>(keys::PRODUCT_DETAILS, |map| map.remove(id).is_some());
    None
  }

  /// Warm the detail cache with products from the same category.
  ///
  /// Returns how many products were cached.
  pub async fn preload_category_products(&self, category: &str) -> usize {
    let products = match self
      .remote
      .fetch_products_by_category(category, RELATED_LIMIT)
      .await
    {
      Ok(products) => products,
      Err(e) => {
        warn!(category, "category preload failed: {}", e);
        return 0;
      }
    };

    let cached = products
      .iter()
      .filter(|p| self.cache_product_detail(p))
      .count();

    let urls = collect_image_urls(&products, RELATED_IMAGES_PER_PRODUCT, RELATED_IMAGE_CAP);
    let images = self.images.prefetch(&urls, false).await;
    debug!(category, cached, images, "category preloaded");
    cached
  }

  // ==========================================================================
  // Read-through
  // ==========================================================================

  fn is_online(&self) -> bool {
    self.status.snapshot().is_online
  }

  /// Product list: network when online, offline catalog otherwise.
  pub async fn products(&self) -> Option<CacheResult<Vec<Product>>> {
    if self.is_online() {
      match self.remote.fetch_products(BULK_LIMIT, 0).await {
        Ok(products) => {
          self.store_bulk(keys::OFFLINE_PRODUCTS, &products);
          return Some(CacheResult::from_network(products));
        }
        Err(e) => warn!("product fetch failed, serving offline catalog: {}", e),
      }
    }

    self
      .valid_bulk(keys::OFFLINE_PRODUCTS)
      .map(|r| CacheResult::offline(r.data, r.timestamp))
  }

  /// Single product: network (cached on the way through) when online.
  pub async fn product(&self, id: &str) -> Option<CacheResult<Product>> {
    if self.is_online() {
      match self.remote.fetch_product(id).await {
        Ok(Some(product)) => {
          self.cache_product_detail(&product);
          return Some(CacheResult::from_network(product));
        }
        Ok(None) => return None,
        Err(e) => warn!(id, "product fetch failed, serving cached detail: {}", e),
      }
    }

    self
      .valid_detail(id)
      .map(|entry| CacheResult::offline(entry.data, entry.cached_at))
  }
}

/// Up to `per_product` URLs from each product, de-duplicated in order, capped at `cap`.
fn collect_image_urls(products: &[Product], per_product: usize, cap: usize) -> Vec<String> {
  let mut urls: Vec<String> = Vec::new();
  for url in products.iter().flat_map(|p| p.image_urls(per_product)) {
    if urls.len() == cap {
      break;
    }
    if !urls.contains(&url) {
      urls.push(url);
    }
  }
  urls
}
