//! Offline-first sync and cache engine for the storefront client.
//!
//! Reads flow from the data service through the catalog and image caches;
//! writes are queued as pending actions and replayed when connectivity
//! returns. [`SyncEngineContext`] ties the pieces together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod event;
pub mod logging;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{CacheResult, CacheSource, OfflineCacheReport};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use event::{CacheProgress, SyncEvent, SyncState, SyncStatus};
pub use remote::{Category, DataService, HttpDataService, Product, ResourceFetcher};
pub use store::{DurableStore, StorageEstimate};
pub use sync::{EngineParts, Mutation, PassOutcome, PendingAction, SyncEngineContext};
