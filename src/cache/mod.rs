//! Offline caching: catalog snapshots, product details, and images.
//!
//! - Every record carries a write stamp and expires after `cache_validity()`
//! - Images resolve through an ordered list of storage tiers
//! - Storage pressure triggers an expiry sweep

mod image;
mod layer;
mod quota;
mod traits;

pub use image::{
  data_uri, BlobTier, EncodedTier, ImageCache, ImageCacheEntry, ImageTier, DEFAULT_RETRIES,
  FETCH_TIMEOUT, PREFETCH_BATCH, RETRY_DELAY_BASE,
};
pub use layer::{
  CacheLayer, OfflineCacheReport, BULK_LIMIT, IMAGES_PER_PRODUCT, RELATED_IMAGES_PER_PRODUCT,
  RELATED_IMAGE_CAP, RELATED_LIMIT,
};
pub use quota::StorageQuotaManager;
pub use traits::{cache_validity, is_valid, BulkRecord, CacheEntry, CacheResult, CacheSource};
