//! One sync pass: drain the pending queue against the data service.

use color_eyre::Result;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::event::SyncStatus;
use crate::remote::{Collection, DataService};

use super::action::{Mutation, PendingAction};
use super::queue::PendingQueue;

/// Actions in flight at once during a pass.
pub const SYNC_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
  pub succeeded: usize,
  /// Failed actions kept for a later pass.
  pub retained: usize,
  /// Failed actions dropped after exhausting retries.
  pub dropped: usize,
}

pub struct SyncEngine {
  queue: Arc<PendingQueue>,
  remote: Arc<dyn DataService>,
  status: SyncStatus,
  syncing: AtomicBool,
}

impl SyncEngine {
  pub fn new(queue: Arc<PendingQueue>, remote: Arc<dyn DataService>, status: SyncStatus) -> Self {
    Self {
      queue,
      remote,
      status,
      syncing: AtomicBool::new(false),
    }
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::SeqCst)
  }

  /// Attempt every queued action once.
  ///
  /// Returns `None` without touching anything when a pass is already running
  /// or there is nothing to send. Actions are started in FIFO order, at most
  /// `SYNC_CONCURRENCY` at a time, and settle independently; one failure
  /// never blocks another.
  pub async fn run_pass(&self) -> Option<PassOutcome> {
    if self.queue.is_empty() {
      return None;
    }
    if self.syncing.swap(true, Ordering::SeqCst) {
      debug!("sync pass already running");
      return None;
    }

    self.status.set_syncing(true);
    let actions = self.queue.snapshot();
    info!(pending = actions.len(), "sync pass started");

    let results = stream::iter(0..actions.len())
      .map(|i| {
        let action = &actions[i];
        async move {
          let result = self.dispatch(action).await;
          (action, result)
        }
      })
      .buffer_unordered(SYNC_CONCURRENCY)
      .collect::<Vec<_>>()
      .await;

    let mut succeeded = HashSet::new();
    let mut failed = HashSet::new();
    for (action, result) in results {
      match result {
        Ok(()) => {
          debug!(action_id = %action.id, kind = action.mutation.label(), "action delivered");
          succeeded.insert(action.id);
        }
        Err(e) => {
          warn!(
            action_id = %action.id,
            kind = action.mutation.label(),
            attempts = action.attempts + 1,
            "action failed: {}",
            e
          );
          failed.insert(action.id);
        }
      }
    }

    let (retained, dropped) = self.queue.apply_pass(&succeeded, &failed);
    let outcome = PassOutcome {
      succeeded: succeeded.len(),
      retained,
      dropped,
    };
    info!(
      succeeded = outcome.succeeded,
      retained, dropped, "sync pass finished"
    );

    self.status.finish_sync(outcome.succeeded, retained, dropped);
    self.syncing.store(false, Ordering::SeqCst);
    Some(outcome)
  }

  async fn dispatch(&self, action: &PendingAction) -> Result<()> {
    match &action.mutation {
      Mutation::WishlistAdd {
        user_id,
        product_id,
      } => {
        let row = json!({ "user_id": user_id, "product_id": product_id });
        self.remote.insert(Collection::Wishlist, row).await
      }
      Mutation::ReviewCreate {
        product_id,
        user_id,
        rating,
        comment,
      } => {
        let row = json!({
          "product_id": product_id,
          "user_id": user_id,
          "rating": rating,
          "comment": comment,
        });
        self.remote.insert(Collection::Reviews, row).await
      }
      Mutation::WishlistRemove { id } => self.remote.delete(Collection::Wishlist, id).await,
      Mutation::ReviewDelete { id } => self.remote.delete(Collection::Reviews, id).await,
    }
  }
}
