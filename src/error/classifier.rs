//! Turns raw failures into typed [`ErrorRecord`]s and keeps a bounded log.

use color_eyre::{Report, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::taxonomy::{ErrorContext, ErrorKind, ErrorRecord, Severity};
use crate::api::identity::IdentityProvider;
use crate::store::{keys, load_document, save_document, KvStore};

/// Oldest records are evicted beyond this many.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Default retry budget handed to retryable records.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ordered substring rules. The first rule with a matching needle wins, so
/// "network update failed" is a network error, not a progress error.
const RULES: &[(&[&str], ErrorKind, Severity, bool)] = &[
  (&["network", "fetch", "timeout"], ErrorKind::Network, Severity::Medium, true),
  (&["navigation", "route"], ErrorKind::Navigation, Severity::Low, false),
  (&["progress", "update"], ErrorKind::ProgressUpdate, Severity::High, true),
  (&["auth", "unauthorized"], ErrorKind::Authentication, Severity::Critical, false),
  (&["api", "server"], ErrorKind::Api, Severity::Medium, true),
  (&["validation", "invalid"], ErrorKind::Validation, Severity::Low, false),
];

/// Map a failure message to its kind, severity and retryability.
pub fn categorize(message: &str) -> (ErrorKind, Severity, bool) {
  let message = message.to_lowercase();
  RULES
    .iter()
    .find(|(needles, ..)| needles.iter().any(|n| message.contains(n)))
    .map(|&(_, kind, severity, retryable)| (kind, severity, retryable))
    .unwrap_or((ErrorKind::Unknown, Severity::Medium, false))
}

/// Error classifier with a persisted, bounded error log.
pub struct ErrorClassifier {
  store: Arc<dyn KvStore>,
  identity: Option<Arc<dyn IdentityProvider>>,
  log: Mutex<VecDeque<ErrorRecord>>,
  max_retries: u32,
}

impl ErrorClassifier {
  /// Create a classifier, restoring any previously persisted log.
  pub fn new(store: Arc<dyn KvStore>, max_retries: u32) -> Result<Self> {
    let log: VecDeque<ErrorRecord> =
      load_document(store.as_ref(), keys::ERROR_LOG)?.unwrap_or_default();

    Ok(Self {
      store,
      identity: None,
      log: Mutex::new(log),
      max_retries,
    })
  }

  /// Signal this identity provider when a critical failure is classified.
  pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
    self.identity = Some(identity);
    self
  }

  fn log_guard(&self) -> MutexGuard<'_, VecDeque<ErrorRecord>> {
    self.log.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Classify a failure. Always succeeds.
  pub fn classify(&self, failure: &Report, context: Option<ErrorContext>) -> ErrorRecord {
    // Alternate formatting includes the whole cause chain
    self.classify_message(&format!("{:#}", failure), context)
  }

  pub fn classify_message(&self, message: &str, context: Option<ErrorContext>) -> ErrorRecord {
    let (kind, severity, retryable) = categorize(message);
    let record = ErrorRecord::new(kind, severity, message, context, retryable, self.max_retries);

    match severity {
      Severity::Critical => error!(id = %record.id, %kind, reason = message, "Critical failure"),
      Severity::High => warn!(id = %record.id, %kind, reason = message, "Failure classified"),
      _ => info!(id = %record.id, %kind, reason = message, "Failure classified"),
    }

    self.append(record.clone());

    if severity == Severity::Critical {
      self.clear_auth_state();
    }

    record
  }

  fn append(&self, record: ErrorRecord) {
    let mut log = self.log_guard();
    log.push_back(record);
    while log.len() > ERROR_LOG_CAPACITY {
      log.pop_front();
    }

    if let Err(e) = save_document(self.store.as_ref(), keys::ERROR_LOG, &*log) {
      warn!(error = %e, "Failed to persist error log");
    }
  }

  /// Drop locally cached credentials so the identity layer re-authenticates.
  fn clear_auth_state(&self) {
    for key in keys::AUTH_STATE {
      if let Err(e) = self.store.remove_item(key) {
        warn!(key, error = %e, "Failed to clear auth state");
      }
    }
    if let Some(identity) = &self.identity {
      identity.authentication_failed();
    }
  }

  /// Snapshot of the error log, oldest first.
  pub fn log(&self) -> Vec<ErrorRecord> {
    self.log_guard().iter().cloned().collect()
  }

  /// The `n` most recent records, newest first.
  pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
    self.log_guard().iter().rev().take(n).cloned().collect()
  }

  pub fn clear_log(&self) -> Result<()> {
    let mut log = self.log_guard();
    log.clear();
    save_document(self.store.as_ref(), keys::ERROR_LOG, &*log)
  }
}
