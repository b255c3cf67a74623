use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::{Config, ServiceConfig};

use super::types::{Category, Collection, FetchedResource, Product};
use super::{DataService, ResourceFetcher};

/// Client for a PostgREST-style data service (`/rest/v1/{table}`).
#[derive(Clone)]
pub struct HttpDataService {
  client: Client,
  base: Url,
  api_key: String,
  schema: Option<String>,
}

impl HttpDataService {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    Self::with_key(&config.service, api_key)
  }

  pub fn with_key(service: &ServiceConfig, api_key: String) -> Result<Self> {
    let mut base = Url::parse(&service.url)
      .map_err(|e| eyre!("Invalid service url {}: {}", service.url, e))?;
    // Url::join replaces the last segment unless the path ends with '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(service.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
      schema: service.schema.clone(),
    })
  }

  fn endpoint(&self, collection: Collection, query: &[(&str, String)]) -> Result<Url> {
    let mut url = self
      .base
      .join(&format!("rest/v1/{}", collection.table()))
      .map_err(|e| eyre!("Failed to build endpoint for {}: {}", collection.table(), e))?;
    if !query.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in query {
        pairs.append_pair(name, value);
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut builder = self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key);
    if let Some(schema) = &self.schema {
      builder = builder
        .header("Accept-Profile", schema)
        .header("Content-Profile", schema);
    }
    builder
  }

  async fn get_rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
    let path = url.path().to_string();
    let response = self
      .request(Method::GET, url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", path, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to fetch {}: HTTP {}", path, status));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {}: {}", path, e))
  }
}

#[async_trait]
impl DataService for HttpDataService {
  async fn ping(&self) -> Result<()> {
    let url = self.endpoint(
      Collection::Categories,
      &[("select", "id".into()), ("limit", "1".into())],
    )?;
    self.get_rows::<Value>(url).await.map(|_| ())
  }

  async fn fetch_products(&self, limit: usize, offset: usize) -> Result<Vec<Product>> {
    let url = self.endpoint(
      Collection::Products,
      &[
        ("select", "*".into()),
        ("order", "created_at.desc".into()),
        ("limit", limit.to_string()),
        ("offset", offset.to_string()),
      ],
    )?;
    self.get_rows(url).await
  }

  async fn fetch_categories(&self) -> Result<Vec<Category>> {
    let url = self.endpoint(
      Collection::Categories,
      &[("select", "*".into()), ("order", "name.asc".into())],
    )?;
    self.get_rows(url).await
  }

  async fn fetch_product(&self, id: &str) -> Result<Option<Product>> {
    let url = self.endpoint(
      Collection::Products,
      &[
        ("select", "*".into()),
        ("id", format!("eq.{}", id)),
        ("limit", "1".into()),
      ],
    )?;
    let rows: Vec<Product> = self.get_rows(url).await?;
    Ok(rows.into_iter().next())
  }

  async fn fetch_products_by_category(
    &self,
    category: &str,
    limit: usize,
  ) -> Result<Vec<Product>> {
    let url = self.endpoint(
      Collection::Products,
      &[
        ("select", "*".into()),
        ("category", format!("eq.{}", category)),
        ("order", "created_at.desc".into()),
        ("limit", limit.to_string()),
      ],
    )?;
    self.get_rows(url).await
  }

  async fn insert(&self, collection: Collection, row: Value) -> Result<()> {
    let url = self.endpoint(collection, &[])?;
    let response = self
      .request(Method::POST, url)
      .header("Prefer", "return=minimal")
      .json(&row)
      .send()
      .await
      .map_err(|e| eyre!("Failed to insert into {}: {}", collection.table(), e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!(
        "Failed to insert into {}: HTTP {}",
        collection.table(),
        status
      ));
    }
    Ok(())
  }

  async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
    let url = self.endpoint(collection, &[("id", format!("eq.{}", id))])?;
    let response = self
      .request(Method::DELETE, url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", id, collection.table(), e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!(
        "Failed to delete {} from {}: HTTP {}",
        id,
        collection.table(),
        status
      ));
    }
    Ok(())
  }
}

#[async_trait]
impl ResourceFetcher for HttpDataService {
  /// Images live on arbitrary hosts, so no service credentials are sent.
  async fn fetch(&self, url: &str) -> Result<FetchedResource> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to fetch {}: HTTP {}", url, status));
    }

    let content_type = response
      .headers()
      .get(header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or("application/octet-stream")
      .to_string();

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    Ok(FetchedResource {
      bytes: bytes.to_vec(),
      content_type,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn service(url: &str) -> HttpDataService {
    let config = ServiceConfig {
      url: url.to_string(),
      schema: None,
      timeout_secs: 5,
    };
    HttpDataService::with_key(&config, "key".into()).unwrap()
  }

  #[test]
  fn test_endpoint_query_encoding() {
    let client = service("https://shop.example.com");
    let url = client
      .endpoint(
        Collection::Products,
        &[("category", "eq.Home & Garden".into()), ("limit", "20".into())],
      )
      .unwrap();

    assert_eq!(
      url.as_str(),
      "https://shop.example.com/rest/v1/products?category=eq.Home+%26+Garden&limit=20"
    );
  }

  #[test]
  fn test_base_path_is_preserved() {
    let client = service("https://gateway.example.com/shop");
    let url = client.endpoint(Collection::Wishlist, &[]).unwrap();
    assert_eq!(url.as_str(), "https://gateway.example.com/shop/rest/v1/wishlist");
  }

  #[test]
  fn test_invalid_url_is_rejected() {
    let config = ServiceConfig {
      url: "not a url".into(),
      schema: None,
      timeout_secs: 5,
    };
    assert!(HttpDataService::with_key(&config, "key".into()).is_err());
  }
}
