//! Persistent key-value storage.
//!
//! - Backends (`SqliteBackend`, `NoopBackend`) report errors
//! - `DurableStore` wraps a backend, never fails, and namespaces keys by
//!   storage-format version so old formats can be purged without migrations

mod backend;
mod durable;

pub use backend::{KeyValueBackend, NoopBackend, SqliteBackend, StorageEstimate};
pub use durable::{keys, DurableStore, STORAGE_PREFIX, STORAGE_VERSION};
