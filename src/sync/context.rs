//! The engine as one explicitly constructed object.
//!
//! `SyncEngineContext` owns the store, caches, queue and background tasks for
//! a process. Construct it once with [`SyncEngineContext::init`] (or
//! [`SyncEngineContext::from_config`]) and pass it to whoever needs the
//! engine; [`SyncEngineContext::shutdown`] stops the background tasks.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{
  BlobTier, CacheLayer, CacheResult, EncodedTier, ImageCache, ImageTier, OfflineCacheReport,
  StorageQuotaManager, DEFAULT_RETRIES,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::event::{CacheProgress, SyncEvent, SyncState, SyncStatus};
use crate::remote::{Category, DataService, HttpDataService, Product, ResourceFetcher};
use crate::store::{
  keys, DurableStore, KeyValueBackend, NoopBackend, SqliteBackend, StorageEstimate,
};

use super::action::{Mutation, PendingAction};
use super::connectivity::ConnectivityMonitor;
use super::engine::{PassOutcome, SyncEngine};
use super::queue::PendingQueue;

/// Wait after the sync trigger holds before starting a pass.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Wait after going online before refreshing the offline catalog.
pub const CACHE_REFRESH_DELAY: Duration = Duration::from_secs(2);

/// Collaborators the engine is assembled from.
pub struct EngineParts {
  pub store: Arc<DurableStore>,
  pub remote: Arc<dyn DataService>,
  pub fetcher: Arc<dyn ResourceFetcher>,
  /// Preferred image tier; the encoded store tier is always the fallback.
  pub blob_tier: Option<BlobTier>,
  pub clock: Arc<dyn Clock>,
  pub initially_online: bool,
}

struct Inner {
  store: Arc<DurableStore>,
  clock: Arc<dyn Clock>,
  status: SyncStatus,
  queue: Arc<PendingQueue>,
  engine: SyncEngine,
  cache: CacheLayer,
  images: Arc<ImageCache>,
  quota: Arc<StorageQuotaManager>,
  connectivity: ConnectivityMonitor,
}

impl Inner {
  /// Run one pass, then record the sync time and refresh the catalog if
  /// anything was delivered.
  async fn sync(&self) -> Option<PassOutcome> {
    let outcome = self.engine.run_pass().await?;
    if outcome.succeeded > 0 {
      let now = self.clock.now();
      self.status.set_last_sync_time(Some(now));
      self.store.set_json(keys::LAST_SYNC, &now);
      self.cache.cache_products_for_offline(false).await;
    }
    Some(outcome)
  }

  /// Pass whenever online with a non-empty queue, after the settle delay.
  ///
  /// A pass that leaves failures behind is not repeated until the next
  /// connectivity change or enqueue.
  async fn drive_sync(self: Arc<Self>) {
    let mut online = self.connectivity.subscribe();
    loop {
      if *online.borrow_and_update() && !self.queue.is_empty() {
        tokio::time::sleep(SETTLE_DELAY).await;
        if *online.borrow() && !self.queue.is_empty() {
          // Enqueues so far are part of this pass
          self.queue.changed().notified().now_or_never();
          self.sync().await;
        }
      }

      tokio::select! {
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
        }
        _ = self.queue.changed().notified() => {}
      }
    }
  }

  /// Refresh the offline catalog shortly after each transition to online.
  async fn drive_refresh(self: Arc<Self>) {
    let mut online = self.connectivity.subscribe();
    let mut was_online = *online.borrow_and_update();
    while online.changed().await.is_ok() {
      let is_online = *online.borrow_and_update();
      if is_online && !was_online {
        tokio::time::sleep(CACHE_REFRESH_DELAY).await;
        if *online.borrow() {
          debug!("refreshing offline catalog after reconnect");
          self.cache.cache_products_for_offline(false).await;
        }
      }
      was_online = *online.borrow();
    }
  }
}

pub struct SyncEngineContext {
  inner: Arc<Inner>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngineContext {
  /// Load persisted state and start the background tasks.
  ///
  /// Must be called inside a tokio runtime.
  pub fn init(parts: EngineParts) -> Self {
    let EngineParts {
      store,
      remote,
      fetcher,
      blob_tier,
      clock,
      initially_online,
    } = parts;

    let status = SyncStatus::new();
    let queue = Arc::new(PendingQueue::load(
      store.clone(),
      clock.clone(),
      status.clone(),
    ));
    status.set_last_sync_time(store.get_json::<DateTime<Utc>>(keys::LAST_SYNC));

    let quota = Arc::new(StorageQuotaManager::new(
      store.clone(),
      clock.clone(),
      status.clone(),
    ));
    let mut tiers: Vec<Arc<dyn ImageTier>> = Vec::new();
    if let Some(blob) = blob_tier {
      tiers.push(Arc::new(blob));
    }
    tiers.push(Arc::new(EncodedTier::new(store.clone(), clock.clone())));
    let images = Arc::new(ImageCache::new(
      tiers,
      fetcher,
      quota.clone(),
      status.clone(),
    ));

    let cache = CacheLayer::new(
      store.clone(),
      clock.clone(),
      remote.clone(),
      images.clone(),
      quota.clone(),
      status.clone(),
    );
    let engine = SyncEngine::new(queue.clone(), remote, status.clone());
    let connectivity = ConnectivityMonitor::spawn(initially_online, status.clone());

    let inner = Arc::new(Inner {
      store,
      clock,
      status,
      queue,
      engine,
      cache,
      images,
      quota,
      connectivity,
    });
    let tasks = vec![
      tokio::spawn(inner.clone().drive_sync()),
      tokio::spawn(inner.clone().drive_refresh()),
    ];

    info!(
      online = initially_online,
      pending = inner.queue.len(),
      "sync engine started"
    );
    Self {
      inner,
      tasks: Mutex::new(tasks),
    }
  }

  /// Assemble the engine from configuration and a live data service.
  ///
  /// An unusable store falls back to a no-op backend: the engine keeps
  /// working online, it just can't cache or persist the queue.
  pub fn from_config(config: &Config, service: Arc<HttpDataService>, online: bool) -> Result<Self> {
    let path = config.store_path()?;
    let backend: Arc<dyn KeyValueBackend> =
      match SqliteBackend::open(&path, config.storage.quota_bytes) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
          warn!(path = %path.display(), "store unavailable, running without persistence: {}", e);
          Arc::new(NoopBackend)
        }
      };

    let blob_tier = if config.images.blob_cache {
      Some(BlobTier::new(config.blob_dir()?, config.images.blob_max_bytes))
    } else {
      None
    };

    Ok(Self::init(EngineParts {
      store: Arc::new(DurableStore::new(backend)),
      remote: service.clone(),
      fetcher: service,
      blob_tier,
      clock: Arc::new(SystemClock),
      initially_online: online,
    }))
  }

  pub fn shutdown(&self) {
    let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
    for task in tasks.drain(..) {
      task.abort();
    }
    self.inner.connectivity.shutdown();
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn state(&self) -> SyncState {
    self.inner.status.snapshot()
  }

  pub fn is_online(&self) -> bool {
    self.inner.status.snapshot().is_online
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.status.snapshot().is_syncing
  }

  pub fn pending_count(&self) -> usize {
    self.inner.status.snapshot().pending_count
  }

  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    self.inner.status.snapshot().last_sync_time
  }

  pub fn cache_progress(&self) -> CacheProgress {
    self.inner.status.snapshot().cache_progress
  }

  pub fn watch(&self) -> watch::Receiver<SyncState> {
    self.inner.status.watch()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.status.subscribe()
  }

  // ==========================================================================
  // Connectivity
  // ==========================================================================

  /// Feed a platform connectivity observation.
  pub fn report_connectivity(&self, online: bool) {
    self.inner.connectivity.report(online);
  }

  /// Derive connectivity from periodic pings of `service`.
  pub fn spawn_probe(&self, service: Arc<dyn DataService>, every: Duration) {
    self.inner.connectivity.spawn_probe(service, every);
  }

  // ==========================================================================
  // Pending actions
  // ==========================================================================

  pub fn add_pending_action(&self, mutation: Mutation) -> Uuid {
    self.inner.queue.enqueue(mutation).id
  }

  pub fn pending_actions(&self) -> Vec<PendingAction> {
    self.inner.queue.snapshot()
  }

  /// Sync now, skipping the settle delay. `None` when offline, already
  /// syncing, or nothing is queued.
  pub async fn sync_pending_actions(&self) -> Option<PassOutcome> {
    if !self.is_online() {
      debug!("sync skipped while offline");
      return None;
    }
    self.inner.sync().await
  }

  // ==========================================================================
  // Caches
  // ==========================================================================

  pub fn cache_data<T: Serialize>(&self, key: &str, data: &T) -> bool {
    self.inner.cache.cache_data(key, data)
  }

  pub fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.inner.cache.get_cached_data(key)
  }

  pub async fn cache_products_for_offline(&self, include_images: bool) -> OfflineCacheReport {
    self.inner.cache.cache_products_for_offline(include_images).await
  }

  pub fn get_offline_products(&self) -> Option<Vec<Product>> {
    self.inner.cache.get_offline_products()
  }

  pub fn get_offline_categories(&self) -> Option<Vec<Category>> {
    self.inner.cache.get_offline_categories()
  }

  pub fn cache_product_detail(&self, product: &Product) -> bool {
    self.inner.cache.cache_product_detail(product)
  }

  pub fn get_cached_product_detail(&self, id: &str) -> Option<Product> {
    self.inner.cache.get_cached_product_detail(id)
  }

  pub async fn preload_category_products(&self, category: &str) -> usize {
    self.inner.cache.preload_category_products(category).await
  }

  pub async fn products(&self) -> Option<CacheResult<Vec<Product>>> {
    self.inner.cache.products().await
  }

  pub async fn product(&self, id: &str) -> Option<CacheResult<Product>> {
    self.inner.cache.product(id).await
  }

  pub fn get_cached_image(&self, url: &str) -> String {
    self.inner.images.get_cached_image(url)
  }

  pub async fn cache_image(&self, url: &str) -> bool {
    self.inner.images.cache_image(url, DEFAULT_RETRIES).await
  }

  pub fn clear_expired_cache(&self) -> usize {
    self.inner.quota.clear_expired_cache()
  }

  pub fn update_storage_usage(&self) -> Option<StorageEstimate> {
    self.inner.quota.update_storage_usage()
  }
}

impl Drop for SyncEngineContext {
  fn drop(&mut self) {
    self.shutdown();
  }
}
