//! Offline write path: pending actions, the sync pass, and the connectivity
//! signal that gates it.

mod action;
mod connectivity;
mod context;
mod engine;
mod queue;

pub use action::{retention, ActionVerb, Mutation, PendingAction, MAX_ATTEMPTS};
pub use connectivity::{ConnectivityMonitor, ONLINE_DEBOUNCE};
pub use context::{EngineParts, SyncEngineContext, CACHE_REFRESH_DELAY, SETTLE_DELAY};
pub use engine::{PassOutcome, SyncEngine, SYNC_CONCURRENCY};
pub use queue::PendingQueue;
