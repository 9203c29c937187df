//! Coalesces progress updates into batched writes.
//!
//! Progress events are frequent (every answer, every lesson completion), so
//! they are collected per learner and sent as one write:
//! - a batch reaching the size threshold is flushed straight away
//! - otherwise a single shared timer, restarted on every enqueue, flushes
//!   every pending batch once the stream goes quiet
//!
//! A batch leaves the pending map before it is handed to the network. A failed
//! flush is not re-queued here; it is reported to the failure handler.

use chrono::{DateTime, Utc};
use color_eyre::Report;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::types::LessonProgress;
use crate::config::BatchConfig;
use crate::writer::ProgressWriter;

/// Pending updates for one learner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchUpdate {
  pub owner_id: String,
  pub updates: Vec<LessonProgress>,
  pub last_touched_at: DateTime<Utc>,
}

impl BatchUpdate {
  fn new(owner_id: &str) -> Self {
    Self {
      owner_id: owner_id.to_string(),
      updates: Vec::new(),
      last_touched_at: Utc::now(),
    }
  }
}

/// Result of handing one batch to the network.
#[derive(Debug)]
pub enum FlushOutcome {
  Flushed { owner_id: String, count: usize },
  Failed { batch: BatchUpdate, error: String },
}

/// Called with every batch whose write failed.
pub type FlushFailureHandler = Arc<dyn Fn(BatchUpdate, &Report) + Send + Sync>;

#[derive(Default)]
struct BatchState {
  pending: HashMap<String, BatchUpdate>,
  timer: Option<JoinHandle<()>>,
  /// Bumped on every timer restart so a superseded timer cannot clear its successor
  timer_generation: u64,
  in_flight: Vec<JoinHandle<FlushOutcome>>,
}

struct BatchInner {
  state: Mutex<BatchState>,
  writer: ProgressWriter,
  config: BatchConfig,
  on_failure: Option<FlushFailureHandler>,
}

/// Batch write coalescer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BatchCoalescer {
  inner: Arc<BatchInner>,
}

impl BatchCoalescer {
  pub fn new(
    writer: ProgressWriter,
    config: BatchConfig,
    on_failure: Option<FlushFailureHandler>,
  ) -> Self {
    Self {
      inner: Arc::new(BatchInner {
        state: Mutex::new(BatchState::default()),
        writer,
        config,
        on_failure,
      }),
    }
  }

  /// Queue an update for `owner_id`. Must be called from within a tokio runtime.
  pub fn enqueue(&self, owner_id: &str, update: LessonProgress) {
    let mut state = self.inner.state();

    let batch = state
      .pending
      .entry(owner_id.to_string())
      .or_insert_with(|| BatchUpdate::new(owner_id));
    batch.updates.push(update);
    batch.last_touched_at = Utc::now();
    let size = batch.updates.len();

    if size >= self.inner.config.max_batch_size {
      if let Some(batch) = state.pending.remove(owner_id) {
        debug!(owner_id, size, "Batch full, flushing now");
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.flush_batch(batch).await });
        state.in_flight.retain(|h| !h.is_finished());
        state.in_flight.push(handle);
      }
      return;
    }

    if let Some(timer) = state.timer.take() {
      timer.abort();
    }
    state.timer_generation += 1;
    let generation = state.timer_generation;
    let inner = Arc::clone(&self.inner);
    let delay = self.inner.config.delay();
    state.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      inner.flush_on_timer(generation);
    }));
  }

  /// Flush everything now and wait for all outstanding writes, including ones
  /// already in flight. Used before shutdown so no update is lost.
  pub async fn flush(&self) -> Vec<FlushOutcome> {
    let (batches, in_flight) = {
      let mut state = self.inner.state();
      if let Some(timer) = state.timer.take() {
        timer.abort();
      }
      let batches: Vec<BatchUpdate> = state.pending.drain().map(|(_, b)| b).collect();
      (batches, std::mem::take(&mut state.in_flight))
    };

    if !batches.is_empty() {
      info!(batches = batches.len(), "Flushing pending batches");
    }

    let mut outcomes = join_all(
      batches
        .into_iter()
        .map(|batch| Arc::clone(&self.inner).flush_batch(batch)),
    )
    .await;

    for result in join_all(in_flight).await {
      match result {
        Ok(outcome) => outcomes.push(outcome),
        Err(e) => warn!(error = %e, "Batch flush task did not complete"),
      }
    }

    outcomes
  }

  /// Number of learners with pending (not yet handed off) updates.
  pub fn pending_owners(&self) -> usize {
    self.inner.state().pending.len()
  }

  /// Number of pending updates across all learners.
  pub fn pending_updates(&self) -> usize {
    self
      .inner
      .state()
      .pending
      .values()
      .map(|b| b.updates.len())
      .sum()
  }
}

impl BatchInner {
  fn state(&self) -> MutexGuard<'_, BatchState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Timer fired: hand every pending batch off to its own write task.
  fn flush_on_timer(self: Arc<Self>, generation: u64) {
    let mut state = self.state();
    if state.timer_generation == generation {
      state.timer = None;
    }

    let batches: Vec<BatchUpdate> = state.pending.drain().map(|(_, b)| b).collect();
    if batches.is_empty() {
      return;
    }
    debug!(batches = batches.len(), "Batch timer fired");

    state.in_flight.retain(|h| !h.is_finished());
    for batch in batches {
      let inner = Arc::clone(&self);
      state
        .in_flight
        .push(tokio::spawn(async move { inner.flush_batch(batch).await }));
    }
  }

  async fn flush_batch(self: Arc<Self>, batch: BatchUpdate) -> FlushOutcome {
    let count = batch.updates.len();
    match self.writer.write(&batch.owner_id, &batch.updates).await {
      Ok(()) => {
        info!(owner_id = %batch.owner_id, count, "Batch flushed");
        FlushOutcome::Flushed {
          owner_id: batch.owner_id,
          count,
        }
      }
      Err(e) => {
        warn!(owner_id = %batch.owner_id, count, error = %e, "Batch flush failed");
        if let Some(handler) = &self.on_failure {
          handler(batch.clone(), &e);
        }
        FlushOutcome::Failed {
          batch,
          error: format!("{:#}", e),
        }
      }
    }
  }
}
