use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::store::StorageEstimate;

/// Bulk prefetch progress, `{0, 0}` when no prefetch is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheProgress {
  pub current: usize,
  pub total: usize,
}

/// Process-wide sync status shown by connectivity banners and pending badges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
  pub is_online: bool,
  pub is_syncing: bool,
  pub pending_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub cache_progress: CacheProgress,
  pub storage: Option<StorageEstimate>,
}

/// Engine events
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Debounced connectivity change
  Connectivity(bool),
  /// A sync pass started
  SyncStarted,
  /// A sync pass finished
  SyncFinished {
    succeeded: usize,
    retained: usize,
    dropped: usize,
  },
  /// Bulk prefetch advanced
  CacheProgress(CacheProgress),
  /// Storage estimate refreshed
  StorageUsage(StorageEstimate),
}

/// Shared status bus: a snapshot channel plus a stream of every transition.
#[derive(Clone)]
pub struct SyncStatus {
  state: Arc<watch::Sender<SyncState>>,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncStatus {
  pub fn new() -> Self {
    let (state, _) = watch::channel(SyncState::default());
    let (events, _) = broadcast::channel(256);
    Self {
      state: Arc::new(state),
      events,
    }
  }

  /// Current state snapshot
  pub fn snapshot(&self) -> SyncState {
    self.state.borrow().clone()
  }

  /// Receiver that is notified whenever the state changes
  pub fn watch(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  /// Receive every event emitted from now on
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  pub fn set_online(&self, online: bool) {
    self.state.send_modify(|s| s.is_online = online);
    self.emit(SyncEvent::Connectivity(online));
  }

  pub fn set_syncing(&self, syncing: bool) {
    self.state.send_modify(|s| s.is_syncing = syncing);
    if syncing {
      self.emit(SyncEvent::SyncStarted);
    }
  }

  pub fn finish_sync(&self, succeeded: usize, retained: usize, dropped: usize) {
    self.state.send_modify(|s| s.is_syncing = false);
    self.emit(SyncEvent::SyncFinished {
      succeeded,
      retained,
      dropped,
    });
  }

  pub fn set_pending_count(&self, count: usize) {
    self.state.send_modify(|s| s.pending_count = count);
  }

  pub fn set_last_sync_time(&self, at: Option<DateTime<Utc>>) {
    self.state.send_modify(|s| s.last_sync_time = at);
  }

  pub fn set_progress(&self, current: usize, total: usize) {
    let progress = CacheProgress { current, total };
    self.state.send_modify(|s| s.cache_progress = progress);
    self.emit(SyncEvent::CacheProgress(progress));
  }

  pub fn set_storage(&self, estimate: StorageEstimate) {
    self.state.send_modify(|s| s.storage = Some(estimate));
    self.emit(SyncEvent::StorageUsage(estimate));
  }
}

impl Default for SyncStatus {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_progress_is_broadcast_and_snapshotted() {
    let status = SyncStatus::new();
    let mut events = status.subscribe();

    status.set_progress(3, 10);

    assert_eq!(
      status.snapshot().cache_progress,
      CacheProgress {
        current: 3,
        total: 10
      }
    );
    assert_eq!(
      events.recv().await.ok(),
      Some(SyncEvent::CacheProgress(CacheProgress {
        current: 3,
        total: 10
      }))
    );
  }

  #[tokio::test]
  async fn test_watch_sees_sync_flag() {
    let status = SyncStatus::new();
    let mut rx = status.watch();

    status.set_syncing(true);
    assert!(rx.changed().await.is_ok());
    assert!(rx.borrow().is_syncing);

    status.finish_sync(1, 0, 0);
    assert!(!status.snapshot().is_syncing);
  }
}
