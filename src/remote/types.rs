use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Catalog product as served by the data service.
///
/// Only the fields the engine inspects are typed; everything else rides along
/// in `extra` so cached records keep the full row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  #[serde(deserialize_with = "id_string")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub price: Option<f64>,
  pub category: Option<String>,
  #[serde(default, deserialize_with = "null_as_empty")]
  pub images: Vec<String>,
  pub image_url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Product {
  /// Up to `limit` distinct image URLs, gallery images first.
  pub fn image_urls(&self, limit: usize) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let candidates = self.images.iter().chain(self.image_url.iter());
    for url in candidates {
      if urls.len() == limit {
        break;
      }
      if !url.is_empty() && !urls.contains(url) {
        urls.push(url.clone());
      }
    }
    urls
  }
}

/// Catalog category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  #[serde(deserialize_with = "id_string")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Remote collections the engine reads from or writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
  Products,
  Categories,
  Wishlist,
  Reviews,
}

impl Collection {
  pub fn table(&self) -> &'static str {
    match self {
      Self::Products => "products",
      Self::Categories => "categories",
      Self::Wishlist => "wishlist",
      Self::Reviews => "reviews",
    }
  }
}

/// Raw body of a fetched resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
  pub bytes: Vec<u8>,
  pub content_type: String,
}

/// Ids arrive as either numbers or strings depending on the table.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}
