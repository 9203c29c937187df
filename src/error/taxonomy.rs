//! Typed error records produced by the classifier.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::api::types::{LessonProgress, ReplayRequest};

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Navigation,
  Api,
  ProgressUpdate,
  Authentication,
  Network,
  Validation,
  Unknown,
}

impl ErrorKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Navigation => "navigation",
      Self::Api => "api",
      Self::ProgressUpdate => "progress_update",
      Self::Authentication => "authentication",
      Self::Network => "network",
      Self::Validation => "validation",
      Self::Unknown => "unknown",
    }
  }

  /// Kinds the retry scheduler knows how to replay.
  pub fn is_retry_kind(self) -> bool {
    matches!(self, Self::Api | Self::ProgressUpdate | Self::Network)
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Low => "low",
      Self::Medium => "medium",
      Self::High => "high",
      Self::Critical => "critical",
    };
    f.write_str(s)
  }
}

/// What the failed operation was doing, kept so it can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
  /// A progress write for one learner
  Progress {
    user_id: String,
    updates: Vec<LessonProgress>,
  },
  /// An HTTP request that can be sent again verbatim
  Request(ReplayRequest),
  /// Anything else worth keeping for diagnostics
  Data { data: Value },
}

/// A classified failure.
///
/// Records are never mutated after creation except for `attempts_made`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
  /// `kind_timestamp_random`; also the retry queue key
  pub id: String,
  pub kind: ErrorKind,
  pub severity: Severity,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub context: Option<ErrorContext>,
  pub occurred_at: DateTime<Utc>,
  pub retryable: bool,
  pub max_retries: u32,
  pub attempts_made: u32,
}

impl ErrorRecord {
  pub fn new(
    kind: ErrorKind,
    severity: Severity,
    message: impl Into<String>,
    context: Option<ErrorContext>,
    retryable: bool,
    max_retries: u32,
  ) -> Self {
    let occurred_at = Utc::now();
    // Kinds without a replay handler are never retryable, whatever the caller says
    let retryable = retryable && kind.is_retry_kind();
    Self {
      id: record_id(kind, occurred_at),
      kind,
      severity,
      message: message.into(),
      context,
      occurred_at,
      retryable,
      max_retries: if retryable { max_retries } else { 0 },
      attempts_made: 0,
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.retryable && self.kind.is_retry_kind()
  }

  pub fn remaining_attempts(&self) -> u32 {
    self.max_retries.saturating_sub(self.attempts_made)
  }

  pub fn is_exhausted(&self) -> bool {
    self.attempts_made >= self.max_retries
  }
}

fn record_id(kind: ErrorKind, at: DateTime<Utc>) -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(9)
    .map(|c| char::from(c).to_ascii_lowercase())
    .collect();
  format!("{}_{}_{}", kind.as_str(), at.timestamp_millis(), suffix)
}
