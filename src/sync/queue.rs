//! Durable FIFO of pending actions.
//!
//! Every mutation of the in-memory list is written through to the store
//! immediately. Only enqueue call sites append; only sync passes increment
//! attempts or remove entries. Until the persisted record has been read
//! successfully it is never overwritten; actions queued meanwhile are merged
//! behind it once a read succeeds.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::event::SyncStatus;
use crate::store::{keys, DurableStore};

use super::action::{Mutation, PendingAction, MAX_ATTEMPTS};

struct QueueState {
  actions: Vec<PendingAction>,
  /// Whether the persisted record has been read
  loaded: bool,
}

pub struct PendingQueue {
  store: Arc<DurableStore>,
  clock: Arc<dyn Clock>,
  status: SyncStatus,
  state: Mutex<QueueState>,
  changed: Notify,
}

impl PendingQueue {
  /// Load the persisted queue, discarding stale or malformed entries.
  pub fn load(store: Arc<DurableStore>, clock: Arc<dyn Clock>, status: SyncStatus) -> Self {
    let state = match read_persisted(&store, clock.as_ref()) {
      Ok(actions) => QueueState {
        actions,
        loaded: true,
      },
      Err(e) => {
        warn!("pending queue unreadable, will retry: {}", e);
        QueueState {
          actions: Vec::new(),
          loaded: false,
        }
      }
    };
    status.set_pending_count(state.actions.len());
    info!(pending = state.actions.len(), loaded = state.loaded, "pending queue loaded");

    Self {
      store,
      clock,
      status,
      state: Mutex::new(state),
      changed: Notify::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if !state.loaded {
      self.reload(&mut state);
    }
    state
  }

  /// Retry reading the persisted record, keeping it ahead of anything queued
  /// since.
  fn reload(&self, state: &mut QueueState) {
    match read_persisted(&self.store, self.clock.as_ref()) {
      Ok(mut persisted) => {
        info!(
          persisted = persisted.len(),
          queued = state.actions.len(),
          "pending queue recovered"
        );
        let queued = !state.actions.is_empty();
        persisted.append(&mut state.actions);
        state.actions = persisted;
        state.loaded = true;
        if queued {
          self.persist(state);
        } else {
          self.status.set_pending_count(state.actions.len());
        }
      }
      Err(e) => debug!("pending queue still unreadable: {}", e),
    }
  }

  fn persist(&self, state: &QueueState) {
    if !state.loaded {
      warn!(pending = state.actions.len(), "pending queue not persisted, stored record unread");
    } else if !self.store.set_json(keys::PENDING_ACTIONS, &state.actions) {
      warn!(pending = state.actions.len(), "pending queue not persisted");
    }
    self.status.set_pending_count(state.actions.len());
  }

  /// Append a mutation and wake the sync driver.
  pub fn enqueue(&self, mutation: Mutation) -> PendingAction {
    let action = PendingAction::new(mutation, self.clock.now());
    {
      let mut state = self.lock();
      state.actions.push(action.clone());
      self.persist(&state);
    }
    debug!(action_id = %action.id, kind = action.mutation.label(), "action enqueued");
    self.changed.notify_one();
    action
  }

  pub fn snapshot(&self) -> Vec<PendingAction> {
    self.lock().actions.clone()
  }

  pub fn len(&self) -> usize {
    self.lock().actions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().actions.is_empty()
  }

  /// Rebuild the queue after a sync pass.
  ///
  /// Succeeded actions are removed and failed ones have `attempts`
  /// incremented, dropping any that exceed `MAX_ATTEMPTS`. Actions enqueued
  /// while the pass ran are left untouched. Returns `(retained, dropped)`
  /// counts for the failed set.
  pub fn apply_pass(&self, succeeded: &HashSet<Uuid>, failed: &HashSet<Uuid>) -> (usize, usize) {
    let mut retained = 0;
    let mut dropped = 0;

    let mut state = self.lock();
    let rebuilt = state
      .actions
      .drain(..)
      .filter(|action| !succeeded.contains(&action.id))
      .filter_map(|mut action| {
        if !failed.contains(&action.id) {
          return Some(action);
        }
        action.attempts += 1;
        if action.attempts > MAX_ATTEMPTS {
          warn!(
            action_id = %action.id,
            kind = action.mutation.label(),
            attempts = action.attempts,
            "action dropped after exhausting retries"
          );
          dropped += 1;
          return None;
        }
        retained += 1;
        Some(action)
      })
      .collect::<Vec<_>>();
    state.actions = rebuilt;
    self.persist(&state);

    (retained, dropped)
  }

  /// Notified on every enqueue.
  pub fn changed(&self) -> &Notify {
    &self.changed
  }
}

fn read_persisted(store: &DurableStore, clock: &dyn Clock) -> Result<Vec<PendingAction>> {
  let Some(raw) = store.try_get_json::<Value>(keys::PENDING_ACTIONS)? else {
    return Ok(Vec::new());
  };
  let Value::Array(entries) = raw else {
    warn!("pending queue record is not a list, discarding");
    store.remove(keys::PENDING_ACTIONS);
    return Ok(Vec::new());
  };

  let total = entries.len();
  let now = clock.now();
  let actions = entries
    .into_iter()
    .filter_map(|entry| serde_json::from_value::<PendingAction>(entry).ok())
    .filter(|action| !action.is_expired(now) && action.attempts <= MAX_ATTEMPTS)
    .collect::<Vec<_>>();

  if actions.len() != total {
    info!(discarded = total - actions.len(), "discarded stale pending actions");
    store.set_json(keys::PENDING_ACTIONS, &actions);
  }
  Ok(actions)
}
