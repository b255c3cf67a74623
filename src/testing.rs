//! In-process fakes for the data service, image host, storage and clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::Clock;
use crate::remote::{Category, Collection, DataService, FetchedResource, Product, ResourceFetcher};
use crate::store::{KeyValueBackend, StorageEstimate};

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: chrono::Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

pub fn product(id: &str, category: &str, images: &[&str]) -> Product {
  Product {
    id: id.to_string(),
    name: format!("Product {}", id),
    price: Some(10.0),
    category: Some(category.to_string()),
    images: images.iter().map(|s| s.to_string()).collect(),
    image_url: None,
    extra: Map::new(),
  }
}

pub fn category(id: &str) -> Category {
  Category {
    id: id.to_string(),
    name: id.to_string(),
    extra: Map::new(),
  }
}

/// In-memory backend with an optional byte quota and failure injection.
#[derive(Default)]
pub struct MemoryBackend {
  entries: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<u64>,
  failing_writes: AtomicUsize,
  failing_reads: AtomicUsize,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: u64) -> Self {
    Self {
      quota_bytes: Some(quota_bytes),
      ..Self::default()
    }
  }

  /// Make the next `count` writes fail.
  pub fn fail_next_writes(&self, count: usize) {
    self.failing_writes.store(count, Ordering::SeqCst);
  }

  /// Make the next `count` reads fail.
  pub fn fail_next_reads(&self, count: usize) {
    self.failing_reads.store(count, Ordering::SeqCst);
  }

  fn used_bytes(entries: &BTreeMap<String, String>, excluding: Option<&str>) -> u64 {
    entries
      .iter()
      .filter(|(k, _)| Some(k.as_str()) != excluding)
      .map(|(k, v)| (k.len() + v.len()) as u64)
      .sum()
  }
}

impl KeyValueBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    if take_one(&self.failing_reads) {
      return Err(eyre!("Injected read failure for {}", key));
    }
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    if take_one(&self.failing_writes) {
      return Err(eyre!("Injected write failure for {}", key));
    }

    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(quota) = self.quota_bytes {
      let used = Self::used_bytes(&entries, Some(key));
      if used + (key.len() + value.len()) as u64 > quota {
        return Err(eyre!("Storage quota exceeded writing {}", key));
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.keys().cloned().collect())
  }

  fn estimate(&self) -> Option<StorageEstimate> {
    let entries = self.entries.lock().ok()?;
    Some(StorageEstimate {
      used: Self::used_bytes(&entries, None),
      quota: self.quota_bytes,
    })
  }
}

fn take_one(counter: &AtomicUsize) -> bool {
  counter
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
    .is_ok()
}

#[derive(Default)]
pub struct FakeDataService {
  pub products: Mutex<Vec<Product>>,
  pub categories: Mutex<Vec<Category>>,
  unreachable: AtomicBool,
  /// Delete ids / inserted product ids whose writes fail
  failing: Mutex<HashSet<String>>,
  pub inserts: Mutex<Vec<(Collection, Value)>>,
  pub deletes: Mutex<Vec<(Collection, String)>>,
  pub bulk_fetches: AtomicUsize,
  /// How long each insert takes
  insert_delay: Mutex<Option<Duration>>,
  in_flight: AtomicUsize,
  pub peak_in_flight: AtomicUsize,
}

impl FakeDataService {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_catalog(products: Vec<Product>, categories: Vec<Category>) -> Self {
    let service = Self::new();
    *service.products.lock().unwrap() = products;
    *service.categories.lock().unwrap() = categories;
    service
  }

  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn fail_on(&self, key: &str) {
    self.failing.lock().unwrap().insert(key.to_string());
  }

  pub fn succeed_on(&self, key: &str) {
    self.failing.lock().unwrap().remove(key);
  }

  fn check_reachable(&self) -> Result<()> {
    if self.unreachable.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }
    Ok(())
  }

  pub fn delay_inserts(&self, delay: Duration) {
    *self.insert_delay.lock().unwrap() = Some(delay);
  }

  pub fn insert_count(&self) -> usize {
    self.inserts.lock().unwrap().len()
  }
}

#[async_trait]
impl DataService for FakeDataService {
  async fn ping(&self) -> Result<()> {
    self.check_reachable()
  }

  async fn fetch_products(&self, limit: usize, offset: usize) -> Result<Vec<Product>> {
    self.check_reachable()?;
    self.bulk_fetches.fetch_add(1, Ordering::SeqCst);
    let products = self.products.lock().unwrap();
    Ok(products.iter().skip(offset).take(limit).cloned().collect())
  }

  async fn fetch_categories(&self) -> Result<Vec<Category>> {
    self.check_reachable()?;
    Ok(self.categories.lock().unwrap().clone())
  }

  async fn fetch_product(&self, id: &str) -> Result<Option<Product>> {
    self.check_reachable()?;
    let products = self.products.lock().unwrap();
    Ok(products.iter().find(|p| p.id == id).cloned())
  }

  async fn fetch_products_by_category(
    &self,
    category: &str,
    limit: usize,
  ) -> Result<Vec<Product>> {
    self.check_reachable()?;
    let products = self.products.lock().unwrap();
    Ok(
      products
        .iter()
        .filter(|p| p.category.as_deref() == Some(category))
        .take(limit)
        .cloned()
        .collect(),
    )
  }

  async fn insert(&self, collection: Collection, row: Value) -> Result<()> {
    self.check_reachable()?;
    let delay = *self.insert_delay.lock().unwrap();
    if let Some(delay) = delay {
      let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    let key = row
      .get("product_id")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    if self.failing.lock().unwrap().contains(&key) {
      return Err(eyre!("insert rejected for {}", key));
    }
    self.inserts.lock().unwrap().push((collection, row));
    Ok(())
  }

  async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
    self.check_reachable()?;
    if self.failing.lock().unwrap().contains(id) {
      return Err(eyre!("delete rejected for {}", id));
    }
    self.deletes.lock().unwrap().push((collection, id.to_string()));
    Ok(())
  }
}

#[derive(Default)]
pub struct FakeFetcher {
  failures: Mutex<HashMap<String, u32>>,
  hanging: Mutex<HashSet<String>>,
  calls: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn png() -> FetchedResource {
    FetchedResource {
      bytes: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a],
      content_type: "image/png".to_string(),
    }
  }

  /// Fail the next `times` fetches of `url`.
  pub fn fail_times(&self, url: &str, times: u32) {
    self.failures.lock().unwrap().insert(url.to_string(), times);
  }

  /// Never answer for `url`.
  pub fn hang(&self, url: &str) {
    self.hanging.lock().unwrap().insert(url.to_string());
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }
}

#[async_trait]
impl ResourceFetcher for FakeFetcher {
  async fn fetch(&self, url: &str) -> Result<FetchedResource> {
    *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

    let hangs = self.hanging.lock().unwrap().contains(url);
    if hangs {
      tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    {
      let mut failures = self.failures.lock().unwrap();
      if let Some(remaining) = failures.get_mut(url) {
        if *remaining > 0 {
          *remaining -= 1;
          return Err(eyre!("fetch failed for {}", url));
        }
      }
    }

    Ok(Self::png())
  }
}
