//! What happens to a failure after it is classified.

use color_eyre::Report;
use std::sync::Arc;
use tracing::warn;

use crate::batch::{BatchUpdate, FlushFailureHandler};
use crate::error::{ErrorClassifier, ErrorContext, ErrorKind, ErrorRecord};
use crate::offline::{OfflineData, OfflineStore};
use crate::retry::RetryScheduler;

/// Classifies failures and routes them to the retry queue and, for progress
/// writes that never reached the server, the offline queue.
#[derive(Clone)]
pub struct Recovery {
  classifier: Arc<ErrorClassifier>,
  retry: RetryScheduler,
  offline: Option<Arc<OfflineStore>>,
}

impl Recovery {
  pub fn new(
    classifier: Arc<ErrorClassifier>,
    retry: RetryScheduler,
    offline: Option<Arc<OfflineStore>>,
  ) -> Self {
    Self {
      classifier,
      retry,
      offline,
    }
  }

  pub fn classifier(&self) -> &Arc<ErrorClassifier> {
    &self.classifier
  }

  /// Classify `failure` and schedule whatever recovery applies. Never fails;
  /// the record is returned for the caller to show.
  pub fn handle(&self, failure: &Report, context: Option<ErrorContext>) -> ErrorRecord {
    let record = self.classifier.classify(failure, context);

    // A network retry only probes, so the payload itself waits in the offline
    // queue and goes out with the next sync.
    if let (ErrorKind::Network, Some(ErrorContext::Progress { user_id, updates }), Some(offline)) =
      (record.kind, &record.context, &self.offline)
    {
      for update in updates {
        let data = OfflineData::Progress(update.clone());
        if let Err(e) = offline.store_offline_data(data, Some(user_id)) {
          warn!(id = %record.id, error = %e, "Failed to queue progress offline");
        }
      }
    }

    if record.is_retryable() {
      self.retry.enqueue(record.clone());
    }
    record
  }

  /// Failure handler for the batch coalescer: a failed flush is recovered
  /// like any other progress write.
  pub fn batch_failure_handler(&self) -> FlushFailureHandler {
    let recovery = self.clone();
    Arc::new(move |batch: BatchUpdate, error: &Report| {
      let context = ErrorContext::Progress {
        user_id: batch.owner_id,
        updates: batch.updates,
      };
      recovery.handle(error, Some(context));
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::LessonProgress;
  use crate::cache::ResponseCache;
  use crate::connectivity::ConnectivityMonitor;
  use crate::retry::{RetryDispatcher, RetryPolicy};
  use crate::store::MemoryStore;
  use crate::testing::MockTransport;
  use crate::writer::ProgressWriter;
  use color_eyre::eyre::eyre;

  struct Fixture {
    recovery: Recovery,
    retry: RetryScheduler,
    offline: Arc<OfflineStore>,
    _monitor: ConnectivityMonitor,
  }

  fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MockTransport::new());
    let monitor = ConnectivityMonitor::new(false);
    let offline = Arc::new(OfflineStore::open(store.clone()).unwrap());
    let classifier = Arc::new(ErrorClassifier::new(store.clone(), 3).unwrap());
    let writer = ProgressWriter::new(transport.clone(), Arc::new(ResponseCache::new()));
    let retry = RetryScheduler::new(
      store,
      RetryPolicy::default(),
      RetryDispatcher::new(writer, transport),
      monitor.status(),
      Some(offline.clone()),
    )
    .unwrap();

    Fixture {
      recovery: Recovery::new(classifier, retry.clone(), Some(offline.clone())),
      retry,
      offline,
      _monitor: monitor,
    }
  }

  fn progress_context() -> ErrorContext {
    ErrorContext::Progress {
      user_id: "u1".to_string(),
      updates: vec![
        LessonProgress::new("basics", "variables", true),
        LessonProgress::new("basics", "loops", false),
      ],
    }
  }

  #[tokio::test]
  async fn test_network_progress_failure_goes_offline_and_retries() {
    let fx = fixture();
    let record = fx
      .recovery
      .handle(&eyre!("network timeout after 15s"), Some(progress_context()));

    assert_eq!(record.kind, ErrorKind::Network);
    assert_eq!(fx.retry.len(), 1);
    let queue = fx.offline.snapshot();
    assert_eq!(queue.progress_updates.len(), 2);
    assert!(queue.progress_updates.iter().all(|p| p.owner_id == "u1"));
  }

  #[tokio::test]
  async fn test_server_failure_is_retried_not_stored() {
    let fx = fixture();
    let record = fx.recovery.handle(
      &eyre!("server error (500) for lesson batch of u1 (2 entries): "),
      Some(progress_context()),
    );

    assert_eq!(record.kind, ErrorKind::Api);
    assert_eq!(fx.retry.len(), 1);
    assert!(fx.offline.is_empty());
  }

  #[tokio::test]
  async fn test_rejected_write_is_neither_retried_nor_stored() {
    let fx = fixture();
    let record = fx.recovery.handle(
      &eyre!("unauthorized (401) for lesson batch of u1 (2 entries): "),
      Some(progress_context()),
    );

    assert_eq!(record.kind, ErrorKind::Authentication);
    assert!(fx.retry.is_empty());
    assert!(fx.offline.is_empty());
  }

  #[tokio::test]
  async fn test_non_retryable_failure_is_only_logged() {
    let fx = fixture();
    let record = fx.recovery.handle(&eyre!("invalid request (422)"), None);

    assert_eq!(record.kind, ErrorKind::Validation);
    assert!(fx.retry.is_empty());
    assert_eq!(fx.recovery.classifier().log().len(), 1);
  }
}
