//! Online/offline tracking.
//!
//! The host feeds transitions in with [`ConnectivityMonitor::set_online`];
//! everyone else holds a cheap [`ConnectivityStatus`] handle. Going online
//! triggers an offline-queue sync in the background. Going offline only
//! changes the observable status; in-flight work is left alone.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Transport;
use crate::offline::Synchronizer;

/// Read-only view of the current connectivity.
#[derive(Debug, Clone)]
pub struct ConnectivityStatus {
  rx: watch::Receiver<bool>,
}

impl ConnectivityStatus {
  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }

  /// Wait for the next transition. Returns `false` once the monitor is gone.
  pub async fn changed(&mut self) -> bool {
    self.rx.changed().await.is_ok()
  }
}

pub struct ConnectivityMonitor {
  tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx }
  }

  pub fn status(&self) -> ConnectivityStatus {
    ConnectivityStatus {
      rx: self.tx.subscribe(),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the host's current connectivity. Repeated values are not transitions.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      if online {
        info!("Connectivity restored");
      } else {
        warn!("Connectivity lost");
      }
    }
  }

  /// On every offline-to-online transition, start a sync without waiting for it.
  pub fn spawn_reconnect_sync(&self, synchronizer: Arc<Synchronizer>) -> JoinHandle<()> {
    let mut rx = self.tx.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !online {
          continue;
        }

        let synchronizer = Arc::clone(&synchronizer);
        tokio::spawn(async move {
          let outcome = synchronizer.sync_offline_data().await;
          debug!(?outcome, "Reconnect sync finished");
        });
      }
    })
  }

  /// Poll the health endpoint and feed the result into [`Self::set_online`].
  /// For hosts that have no native online/offline events.
  pub fn spawn_health_probe(
    self: &Arc<Self>,
    transport: Arc<dyn Transport>,
    interval: Duration,
  ) -> JoinHandle<()> {
    let monitor = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        match transport.probe().await {
          Ok(()) => monitor.set_online(true),
          Err(e) => {
            debug!(error = %e, "Health probe failed");
            monitor.set_online(false);
          }
        }
      }
    })
  }
}
