//! Retry scheduler for classified failures.
//!
//! Every retryable [`ErrorRecord`] gets its own task that sleeps through a
//! capped exponential backoff, replays the failed operation and either removes
//! the record or counts the attempt. Attempts for one record never overlap.
//! The queue is persisted after every change and picked up again by
//! [`RetryScheduler::resume`] on the next start.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Transport;
use crate::connectivity::ConnectivityStatus;
use crate::error::{ErrorContext, ErrorKind, ErrorRecord};
use crate::offline::{OfflineData, OfflineStore, Synchronizer};
use crate::store::{keys, load_document, save_document, KvStore};
use crate::writer::ProgressWriter;

/// Action name used when an exhausted record is parked in the offline queue.
pub const ABANDONED_ACTION: &str = "retry_abandoned";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub backoff_multiplier: f64,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      backoff_multiplier: 2.0,
      max_delay: Duration::from_millis(10_000),
    }
  }
}

impl RetryPolicy {
  /// `min(max_delay, base_delay * backoff_multiplier^attempts)`
  pub fn backoff_delay(&self, attempts: u32) -> Duration {
    let exponent = attempts.min(i32::MAX as u32) as i32;
    let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
    let max_millis = self.max_delay.as_millis() as f64;

    if !millis.is_finite() || millis >= max_millis {
      self.max_delay
    } else {
      Duration::from_millis(millis as u64)
    }
  }
}

/// Replays the operation behind a failed record.
pub struct RetryDispatcher {
  writer: ProgressWriter,
  transport: Arc<dyn Transport>,
  synchronizer: Option<Arc<Synchronizer>>,
}

impl RetryDispatcher {
  pub fn new(writer: ProgressWriter, transport: Arc<dyn Transport>) -> Self {
    Self {
      writer,
      transport,
      synchronizer: None,
    }
  }

  /// Start an offline sync whenever a network retry finds the server reachable.
  pub fn with_synchronizer(mut self, synchronizer: Arc<Synchronizer>) -> Self {
    self.synchronizer = Some(synchronizer);
    self
  }

  pub async fn dispatch(&self, record: &ErrorRecord) -> Result<()> {
    match (record.kind, &record.context) {
      (
        ErrorKind::ProgressUpdate | ErrorKind::Api,
        Some(ErrorContext::Progress { user_id, updates }),
      ) => self.writer.write(user_id, updates).await,
      (ErrorKind::ProgressUpdate, _) => Err(eyre!(
        "Record {} has no progress payload to replay",
        record.id
      )),
      (ErrorKind::Api, Some(ErrorContext::Request(request))) => {
        self.transport.replay(request).await
      }
      (ErrorKind::Api, _) => Err(eyre!("Record {} has no request to replay", record.id)),
      (ErrorKind::Network, _) => {
        self.transport.probe().await?;
        if let Some(synchronizer) = &self.synchronizer {
          let synchronizer = Arc::clone(synchronizer);
          tokio::spawn(async move {
            let outcome = synchronizer.sync_offline_data().await;
            debug!(?outcome, "Sync after network recovery finished");
          });
        }
        Ok(())
      }
      (kind, _) => Err(eyre!("No retry handler for {} failures", kind)),
    }
  }
}

struct RetryInner {
  queue: Mutex<BTreeMap<String, ErrorRecord>>,
  tasks: Mutex<HashMap<String, JoinHandle<()>>>,
  store: Arc<dyn KvStore>,
  policy: RetryPolicy,
  dispatcher: RetryDispatcher,
  connectivity: ConnectivityStatus,
  offline: Option<Arc<OfflineStore>>,
}

/// Retry scheduler. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct RetryScheduler {
  inner: Arc<RetryInner>,
}

impl RetryScheduler {
  /// Create a scheduler, restoring the persisted queue. Nothing runs until
  /// [`Self::resume`] is called.
  pub fn new(
    store: Arc<dyn KvStore>,
    policy: RetryPolicy,
    dispatcher: RetryDispatcher,
    connectivity: ConnectivityStatus,
    offline: Option<Arc<OfflineStore>>,
  ) -> Result<Self> {
    let queue: BTreeMap<String, ErrorRecord> =
      load_document(store.as_ref(), keys::RETRY_QUEUE)?.unwrap_or_default();

    Ok(Self {
      inner: Arc::new(RetryInner {
        queue: Mutex::new(queue),
        tasks: Mutex::new(HashMap::new()),
        store,
        policy,
        dispatcher,
        connectivity,
        offline,
      }),
    })
  }

  /// Queue a record for retry. Returns its id, or `None` if the record is not
  /// retryable. Must be called from within a tokio runtime.
  pub fn enqueue(&self, record: ErrorRecord) -> Option<String> {
    if !record.is_retryable() || record.is_exhausted() {
      debug!(id = %record.id, kind = %record.kind, "Record not retryable, skipping");
      return None;
    }

    let id = record.id.clone();
    {
      let mut queue = self.inner.queue();
      queue.insert(id.clone(), record);
      self.inner.persist(&queue);
    }
    info!(id = %id, "Retry scheduled");

    self.inner.spawn(&id);
    Some(id)
  }

  /// Start a task for every queued record that has none. Returns how many
  /// were started.
  pub fn resume(&self) -> usize {
    let ids: Vec<String> = self.inner.queue().keys().cloned().collect();
    let started = ids.iter().filter(|id| self.inner.spawn(id)).count();
    if started > 0 {
      info!(records = started, "Resumed persisted retries");
    }
    started
  }

  /// Stop every retry task. The queue stays persisted for the next resume.
  pub fn shutdown(&self) {
    for (_, handle) in self.inner.tasks().drain() {
      handle.abort();
    }
  }

  /// Snapshot of the queue in id order.
  pub fn pending(&self) -> Vec<ErrorRecord> {
    self.inner.queue().values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.queue().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl RetryInner {
  fn queue(&self) -> MutexGuard<'_, BTreeMap<String, ErrorRecord>> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn persist(&self, queue: &BTreeMap<String, ErrorRecord>) {
    if let Err(e) = save_document(self.store.as_ref(), keys::RETRY_QUEUE, queue) {
      warn!(error = %e, "Failed to persist retry queue");
    }
  }

  /// Returns `false` if a task for `id` is already running.
  fn spawn(self: &Arc<Self>, id: &str) -> bool {
    let mut tasks = self.tasks();
    tasks.retain(|_, handle| !handle.is_finished());
    if tasks.contains_key(id) {
      return false;
    }

    let inner = Arc::clone(self);
    let task_id = id.to_string();
    let handle = tokio::spawn(async move { inner.run(task_id).await });
    tasks.insert(id.to_string(), handle);
    true
  }

  async fn run(self: Arc<Self>, id: String) {
    loop {
      let Some(record) = self.queue().get(&id).cloned() else {
        return;
      };

      tokio::time::sleep(self.policy.backoff_delay(record.attempts_made)).await;

      if record.kind == ErrorKind::Network && !self.connectivity.is_online() {
        debug!(id = %id, "Offline, postponing network retry");
        continue;
      }

      let attempt = record.attempts_made + 1;
      info!(id = %id, kind = %record.kind, attempt, max = record.max_retries, "Retrying");

      match self.dispatcher.dispatch(&record).await {
        Ok(()) => {
          let mut queue = self.queue();
          queue.remove(&id);
          self.persist(&queue);
          info!(id = %id, attempt, "Retry succeeded");
          return;
        }
        Err(e) => {
          warn!(id = %id, attempt, error = %e, "Retry attempt failed");
          if let Some(exhausted) = self.record_failure(&id) {
            self.abandon(exhausted);
            return;
          }
        }
      }
    }
  }

  /// Count a failed attempt. Returns the record, already removed from the
  /// queue, once it has no attempts left.
  fn record_failure(&self, id: &str) -> Option<ErrorRecord> {
    let mut queue = self.queue();
    let record = queue.get_mut(id)?;
    record.attempts_made += 1;

    let exhausted = if record.is_exhausted() {
      queue.remove(id)
    } else {
      None
    };
    self.persist(&queue);
    exhausted
  }

  fn abandon(&self, record: ErrorRecord) {
    warn!(
      id = %record.id,
      kind = %record.kind,
      attempts = record.attempts_made,
      reason = %record.message,
      "Retries exhausted, giving up"
    );

    let (Some(offline), Some(context)) = (&self.offline, &record.context) else {
      return;
    };

    let owner_id = match context {
      ErrorContext::Progress { user_id, .. } => Some(user_id.clone()),
      _ => None,
    };
    let payload = match serde_json::to_value(&record) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(id = %record.id, error = %e, "Failed to serialize abandoned record");
        return;
      }
    };

    let data = OfflineData::Action {
      name: ABANDONED_ACTION.to_string(),
      payload,
    };
    if let Err(e) = offline.store_offline_data(data, owner_id.as_deref()) {
      warn!(id = %record.id, error = %e, "Failed to park abandoned record offline");
    }
  }
}
