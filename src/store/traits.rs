//! Core trait for the durable key-value store.

use color_eyre::Result;

/// A string-to-string store that persists across restarts.
///
/// Writes are full-value overwrites: callers read the whole document, modify
/// it and write it back. There is no field-level merge.
pub trait KvStore: Send + Sync {
  /// Read the value stored under `key`, if any.
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove_item(&self, key: &str) -> Result<()>;
}

/// Fixed, namespaced keys used by the core.
pub mod keys {
  /// Bounded log of classified errors
  pub const ERROR_LOG: &str = "pykids.error_log";
  /// Records waiting for a retry attempt
  pub const RETRY_QUEUE: &str = "pykids.retry_queue";
  /// Mutations recorded while the network was unavailable
  pub const OFFLINE_QUEUE: &str = "pykids.offline_queue";

  /// Locally cached credential state. Cleared on critical auth failures.
  pub const AUTH_STATE: &[&str] = &["pykids.auth.token", "pykids.auth.user"];
}
