//! Failure taxonomy and classification.
//!
//! Every failure the core observes is classified into an [`ErrorRecord`]
//! instead of being propagated as an opaque error. Callers branch on the
//! record's kind and retryability.

mod classifier;
mod taxonomy;

pub use classifier::{categorize, ErrorClassifier, DEFAULT_MAX_RETRIES, ERROR_LOG_CAPACITY};
pub use taxonomy::{ErrorContext, ErrorKind, ErrorRecord, Severity};
