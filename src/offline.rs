//! Offline queue and the synchronizer that replays it.
//!
//! Work that cannot reach the server is appended to a persisted
//! [`OfflineQueue`]. When connectivity returns, [`Synchronizer`] replays the
//! queued progress updates one at a time through the shared write path and
//! then drains the queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::api::types::LessonProgress;
use crate::connectivity::ConnectivityStatus;
use crate::store::{keys, load_document, save_document, KvStore};
use crate::writer::ProgressWriter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProgress {
  pub id: String,
  pub owner_id: String,
  pub progress: LessonProgress,
  pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNavigation {
  pub id: String,
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner_id: Option<String>,
  pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
  pub id: String,
  pub action_name: String,
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner_id: Option<String>,
  pub queued_at: DateTime<Utc>,
}

/// Everything waiting for connectivity, in arrival order per queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueue {
  pub progress_updates: Vec<PendingProgress>,
  pub navigation: Vec<PendingNavigation>,
  pub actions: Vec<PendingAction>,
}

impl OfflineQueue {
  pub fn len(&self) -> usize {
    self.progress_updates.len() + self.navigation.len() + self.actions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// What to store offline.
#[derive(Debug, Clone)]
pub enum OfflineData {
  Progress(LessonProgress),
  Navigation(String),
  Action { name: String, payload: Value },
}

/// What a sync pass does with progress entries whose replay failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
  /// Keep failed entries for the next pass
  #[default]
  RetainFailed,
  /// Drop the whole queue after a pass, failed entries included
  ClearAll,
}

/// Persisted store of offline work.
pub struct OfflineStore {
  queue: Mutex<OfflineQueue>,
  store: Arc<dyn KvStore>,
  next_seq: AtomicU64,
}

impl OfflineStore {
  /// Open the store, restoring any queue persisted by a previous run.
  pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
    let queue: OfflineQueue =
      load_document(store.as_ref(), keys::OFFLINE_QUEUE)?.unwrap_or_default();
    if !queue.is_empty() {
      info!(entries = queue.len(), "Restored offline queue");
    }

    Ok(Self {
      queue: Mutex::new(queue),
      store,
      next_seq: AtomicU64::new(0),
    })
  }

  fn queue(&self) -> MutexGuard<'_, OfflineQueue> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn next_id(&self, prefix: &str, at: DateTime<Utc>) -> String {
    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", prefix, at.timestamp_millis(), seq)
  }

  /// Append a record to the matching queue and persist the whole structure.
  /// Returns the id of the new entry.
  pub fn store_offline_data(&self, data: OfflineData, owner_id: Option<&str>) -> Result<String> {
    let queued_at = Utc::now();
    let mut queue = self.queue();

    let id = match data {
      OfflineData::Progress(progress) => {
        let owner_id = owner_id.ok_or_else(|| eyre!("Offline progress needs an owner"))?;
        let id = self.next_id("progress", queued_at);
        queue.progress_updates.push(PendingProgress {
          id: id.clone(),
          owner_id: owner_id.to_string(),
          progress,
          queued_at,
        });
        id
      }
      OfflineData::Navigation(path) => {
        let id = self.next_id("navigation", queued_at);
        queue.navigation.push(PendingNavigation {
          id: id.clone(),
          path,
          owner_id: owner_id.map(String::from),
          queued_at,
        });
        id
      }
      OfflineData::Action { name, payload } => {
        let id = self.next_id("action", queued_at);
        queue.actions.push(PendingAction {
          id: id.clone(),
          action_name: name,
          payload,
          owner_id: owner_id.map(String::from),
          queued_at,
        });
        id
      }
    };

    save_document(self.store.as_ref(), keys::OFFLINE_QUEUE, &*queue)?;
    info!(id = %id, pending = queue.len(), "Stored offline");
    Ok(id)
  }

  pub fn snapshot(&self) -> OfflineQueue {
    self.queue().clone()
  }

  pub fn len(&self) -> usize {
    self.queue().len()
  }

  pub fn is_empty(&self) -> bool {
    self.queue().is_empty()
  }

  /// Remove everything a sync pass saw, except `keep`. Entries appended while
  /// the pass was replaying are left in place.
  fn finish_pass(&self, seen: &OfflineQueue, keep: &HashSet<String>) -> Result<()> {
    let seen_ids: HashSet<&str> = seen
      .progress_updates
      .iter()
      .map(|p| p.id.as_str())
      .chain(seen.navigation.iter().map(|n| n.id.as_str()))
      .chain(seen.actions.iter().map(|a| a.id.as_str()))
      .collect();
    let discard = |id: &str| seen_ids.contains(id) && !keep.contains(id);

    let mut queue = self.queue();
    queue.progress_updates.retain(|p| !discard(p.id.as_str()));
    queue.navigation.retain(|n| !discard(n.id.as_str()));
    queue.actions.retain(|a| !discard(a.id.as_str()));

    save_document(self.store.as_ref(), keys::OFFLINE_QUEUE, &*queue)
  }
}

/// Result of a sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
  /// Ids of progress entries written successfully
  pub replayed: Vec<String>,
  /// Ids of progress entries whose write failed
  pub failed: Vec<String>,
  /// Failed entries kept for the next pass
  pub retained: usize,
  /// Navigation history and actions removed from the queue, for the host to handle
  pub drained_navigation: Vec<PendingNavigation>,
  pub drained_actions: Vec<PendingAction>,
}

#[derive(Debug)]
pub enum SyncOutcome {
  /// Another pass is running
  AlreadyRunning,
  Offline,
  Completed(SyncReport),
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Replays the offline queue. At most one pass runs at a time.
pub struct Synchronizer {
  offline: Arc<OfflineStore>,
  writer: ProgressWriter,
  connectivity: ConnectivityStatus,
  policy: SyncPolicy,
  sync_in_progress: AtomicBool,
}

impl Synchronizer {
  pub fn new(
    offline: Arc<OfflineStore>,
    writer: ProgressWriter,
    connectivity: ConnectivityStatus,
    policy: SyncPolicy,
  ) -> Self {
    Self {
      offline,
      writer,
      connectivity,
      policy,
      sync_in_progress: AtomicBool::new(false),
    }
  }

  pub fn is_syncing(&self) -> bool {
    self.sync_in_progress.load(Ordering::SeqCst)
  }

  pub async fn sync_offline_data(&self) -> SyncOutcome {
    if self
      .sync_in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return SyncOutcome::AlreadyRunning;
    }
    let _guard = SyncGuard(&self.sync_in_progress);

    if !self.connectivity.is_online() {
      return SyncOutcome::Offline;
    }

    let seen = self.offline.snapshot();
    if seen.is_empty() {
      return SyncOutcome::Completed(SyncReport::default());
    }
    info!(entries = seen.len(), "Syncing offline queue");

    let mut report = SyncReport::default();
    for entry in &seen.progress_updates {
      match self
        .writer
        .write(&entry.owner_id, std::slice::from_ref(&entry.progress))
        .await
      {
        Ok(()) => report.replayed.push(entry.id.clone()),
        Err(e) => {
          warn!(id = %entry.id, owner_id = %entry.owner_id, error = %e, "Offline replay failed");
          report.failed.push(entry.id.clone());
        }
      }
    }

    let keep: HashSet<String> = match self.policy {
      SyncPolicy::RetainFailed => report.failed.iter().cloned().collect(),
      SyncPolicy::ClearAll => HashSet::new(),
    };
    report.retained = keep.len();
    if let Err(e) = self.offline.finish_pass(&seen, &keep) {
      warn!(error = %e, "Failed to persist offline queue after sync");
    }

    report.drained_navigation = seen.navigation;
    report.drained_actions = seen.actions;
    info!(
      replayed = report.replayed.len(),
      failed = report.failed.len(),
      retained = report.retained,
      "Offline sync finished"
    );
    SyncOutcome::Completed(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseCache;
  use crate::connectivity::ConnectivityMonitor;
  use crate::store::MemoryStore;
  use crate::testing::MockTransport;
  use std::time::Duration;

  struct Fixture {
    store: Arc<MemoryStore>,
    offline: Arc<OfflineStore>,
    transport: Arc<MockTransport>,
    monitor: ConnectivityMonitor,
  }

  impl Fixture {
    fn new() -> Self {
      let store = Arc::new(MemoryStore::new());
      let offline = Arc::new(OfflineStore::open(store.clone()).unwrap());
      Self {
        store,
        offline,
        transport: Arc::new(MockTransport::new()),
        monitor: ConnectivityMonitor::new(true),
      }
    }

    fn synchronizer(&self, policy: SyncPolicy) -> Synchronizer {
      let writer = ProgressWriter::new(self.transport.clone(), Arc::new(ResponseCache::new()));
      Synchronizer::new(self.offline.clone(), writer, self.monitor.status(), policy)
    }
  }

  fn progress(topic: &str) -> OfflineData {
    OfflineData::Progress(LessonProgress::new("basics", topic, true))
  }

  #[test]
  fn test_store_routes_to_matching_queue_and_persists() {
    let fx = Fixture::new();
    fx.offline
      .store_offline_data(progress("variables"), Some("u1"))
      .unwrap();
    fx.offline
      .store_offline_data(OfflineData::Navigation("/lessons/2".to_string()), None)
      .unwrap();
    fx.offline
      .store_offline_data(
        OfflineData::Action {
          name: "quiz_answer".to_string(),
          payload: serde_json::json!({"q": 1}),
        },
        Some("u1"),
      )
      .unwrap();

    let queue = fx.offline.snapshot();
    assert_eq!(queue.progress_updates.len(), 1);
    assert_eq!(queue.navigation.len(), 1);
    assert_eq!(queue.actions.len(), 1);

    let reopened = OfflineStore::open(fx.store.clone()).unwrap();
    assert_eq!(reopened.snapshot(), queue);
  }

  #[test]
  fn test_ids_are_unique() {
    let fx = Fixture::new();
    let a = fx.offline.store_offline_data(progress("t"), Some("u1")).unwrap();
    let b = fx.offline.store_offline_data(progress("t"), Some("u1")).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn test_progress_without_owner_is_rejected() {
    let fx = Fixture::new();
    assert!(fx.offline.store_offline_data(progress("t"), None).is_err());
    assert!(fx.offline.is_empty());
  }

  #[tokio::test]
  async fn test_sync_replays_duplicates_and_drains() {
    let fx = Fixture::new();
    let update = LessonProgress::new("basics", "loops", true).with_score(8);
    for _ in 0..2 {
      fx.offline
        .store_offline_data(OfflineData::Progress(update.clone()), Some("u1"))
        .unwrap();
    }
    fx.offline
      .store_offline_data(OfflineData::Navigation("/quiz".to_string()), None)
      .unwrap();

    let outcome = fx.synchronizer(SyncPolicy::RetainFailed).sync_offline_data().await;
    let SyncOutcome::Completed(report) = outcome else {
      panic!("sync did not run");
    };

    // No dedup: both copies go out with the same payload
    let calls = fx.transport.batch_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[0].1, vec![update]);
    assert_eq!(report.replayed.len(), 2);
    assert_eq!(report.drained_navigation.len(), 1);
    assert!(fx.offline.is_empty());

    let reopened = OfflineStore::open(fx.store.clone()).unwrap();
    assert!(reopened.is_empty());
  }

  #[tokio::test]
  async fn test_sync_is_noop_while_offline() {
    let fx = Fixture::new();
    fx.offline.store_offline_data(progress("t"), Some("u1")).unwrap();
    fx.monitor.set_online(false);

    let outcome = fx.synchronizer(SyncPolicy::RetainFailed).sync_offline_data().await;
    assert!(matches!(outcome, SyncOutcome::Offline));
    assert!(fx.transport.batch_calls().is_empty());
    assert_eq!(fx.offline.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_sync_runs_one_pass() {
    let fx = Fixture::new();
    fx.transport.set_latency(Duration::from_millis(100));
    fx.offline.store_offline_data(progress("a"), Some("u1")).unwrap();
    fx.offline.store_offline_data(progress("b"), Some("u1")).unwrap();

    let sync = fx.synchronizer(SyncPolicy::RetainFailed);
    let (first, second) = tokio::join!(sync.sync_offline_data(), sync.sync_offline_data());

    assert!(matches!(first, SyncOutcome::Completed(_)));
    assert!(matches!(second, SyncOutcome::AlreadyRunning));
    assert_eq!(fx.transport.batch_calls().len(), 2);
    assert!(!sync.is_syncing());
  }

  #[tokio::test]
  async fn test_retain_failed_keeps_failing_entries() {
    let fx = Fixture::new();
    fx.offline.store_offline_data(progress("a"), Some("u1")).unwrap();
    fx.offline.store_offline_data(progress("b"), Some("u1")).unwrap();
    fx.transport.fail_batches_times(1, "server error (500)");

    let SyncOutcome::Completed(report) =
      fx.synchronizer(SyncPolicy::RetainFailed).sync_offline_data().await
    else {
      panic!("sync did not run");
    };

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.retained, 1);
    let queue = fx.offline.snapshot();
    assert_eq!(queue.progress_updates.len(), 1);
    assert_eq!(queue.progress_updates[0].progress.topic_id, "a");
  }

  #[tokio::test]
  async fn test_retained_entries_go_out_once_server_recovers() {
    let fx = Fixture::new();
    fx.offline.store_offline_data(progress("a"), Some("u1")).unwrap();
    fx.offline.store_offline_data(progress("b"), Some("u1")).unwrap();
    fx.transport.fail_batches("server error (500)");

    let sync = fx.synchronizer(SyncPolicy::RetainFailed);
    let SyncOutcome::Completed(report) = sync.sync_offline_data().await else {
      panic!("sync did not run");
    };
    assert!(report.replayed.is_empty());
    assert_eq!(report.retained, 2);

    fx.transport.succeed_batches();
    let SyncOutcome::Completed(report) = sync.sync_offline_data().await else {
      panic!("sync did not run");
    };
    assert_eq!(report.replayed.len(), 2);
    assert_eq!(report.retained, 0);
    assert!(fx.offline.is_empty());
  }

  #[tokio::test]
  async fn test_clear_all_drops_failing_entries() {
    let fx = Fixture::new();
    fx.offline.store_offline_data(progress("a"), Some("u1")).unwrap();
    fx.transport.fail_batches("server error (500)");

    let SyncOutcome::Completed(report) =
      fx.synchronizer(SyncPolicy::ClearAll).sync_offline_data().await
    else {
      panic!("sync did not run");
    };

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.retained, 0);
    assert!(fx.offline.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_entries_added_during_pass_survive() {
    let fx = Fixture::new();
    fx.transport.set_latency(Duration::from_millis(100));
    fx.offline.store_offline_data(progress("a"), Some("u1")).unwrap();

    let sync = fx.synchronizer(SyncPolicy::ClearAll);
    let offline = fx.offline.clone();
    let late = async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      offline.store_offline_data(progress("late"), Some("u1")).unwrap();
    };
    let (outcome, ()) = tokio::join!(sync.sync_offline_data(), late);

    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    let queue = fx.offline.snapshot();
    assert_eq!(queue.progress_updates.len(), 1);
    assert_eq!(queue.progress_updates[0].progress.topic_id, "late");
  }
}
