//! The remote data service the engine reads from and replays actions against.

mod client;
mod types;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;

pub use client::HttpDataService;
pub use types::{Category, Collection, FetchedResource, Product};

/// Operations the engine consumes from the data service.
#[async_trait]
pub trait DataService: Send + Sync {
  /// Cheap reachability check used by the connectivity probe.
  async fn ping(&self) -> Result<()>;

  /// Products, newest first.
  async fn fetch_products(&self, limit: usize, offset: usize) -> Result<Vec<Product>>;

  async fn fetch_categories(&self) -> Result<Vec<Category>>;

  async fn fetch_product(&self, id: &str) -> Result<Option<Product>>;

  async fn fetch_products_by_category(&self, category: &str, limit: usize)
    -> Result<Vec<Product>>;

  async fn insert(&self, collection: Collection, row: Value) -> Result<()>;

  async fn delete(&self, collection: Collection, id: &str) -> Result<()>;
}

/// Fetches binary resources (images) by URL.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
  async fn fetch(&self, url: &str) -> Result<FetchedResource>;
}
