//! Debounced online/offline signal.
//!
//! Offline reports apply immediately. Online reports only take effect after
//! `ONLINE_DEBOUNCE` passes without a contradicting report; a repeated online
//! report restarts the wait.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::event::SyncStatus;
use crate::remote::DataService;

pub const ONLINE_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConnectivityMonitor {
  reports: mpsc::UnboundedSender<bool>,
  online: watch::Receiver<bool>,
  task: JoinHandle<()>,
  probe: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
  /// Start the debounce task. Must be called inside a tokio runtime.
  pub fn spawn(initial: bool, status: SyncStatus) -> Self {
    let (reports, mut rx) = mpsc::unbounded_channel::<bool>();
    let (online_tx, online) = watch::channel(initial);
    status.set_online(initial);

    let task = tokio::spawn(async move {
      let mut deadline: Option<Instant> = None;
      loop {
        tokio::select! {
          report = rx.recv() => match report {
            None => break,
            Some(false) => {
              deadline = None;
              publish(&online_tx, &status, false);
            }
            Some(true) if *online_tx.borrow() => deadline = None,
            Some(true) => {
              debug!("online reported, debouncing");
              deadline = Some(Instant::now() + ONLINE_DEBOUNCE);
            }
          },
          _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
            deadline = None;
            publish(&online_tx, &status, true);
          }
        }
      }
    });

    Self {
      reports,
      online,
      task,
      probe: Mutex::new(None),
    }
  }

  /// Feed a platform connectivity observation.
  pub fn report(&self, online: bool) {
    let _ = self.reports.send(online);
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.online.clone()
  }

  /// Periodically ping `service` and report the result.
  pub fn spawn_probe(&self, service: Arc<dyn DataService>, every: Duration) {
    let reports = self.reports.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let reachable = service.ping().await.is_ok();
        if reports.send(reachable).is_err() {
          break;
        }
      }
    });

    let mut probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = probe.replace(handle) {
      previous.abort();
    }
  }

  pub fn shutdown(&self) {
    self.task.abort();
    if let Some(probe) = self.probe.lock().unwrap_or_else(|e| e.into_inner()).take() {
      probe.abort();
    }
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn publish(online_tx: &watch::Sender<bool>, status: &SyncStatus, online: bool) {
  let changed = online_tx.send_if_modified(|current| {
    if *current == online {
      return false;
    }
    *current = online;
    true
  });
  if changed {
    info!(online, "connectivity changed");
    status.set_online(online);
  }
}
