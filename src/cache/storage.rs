//! In-memory response cache with per-entry expiry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::traits::CacheEntry;

type ErasedEntry = CacheEntry<Box<dyn Any + Send + Sync>>;

/// Volatile cache of server responses keyed by `category_id` strings.
///
/// Entries are only removed by expiry or explicit invalidation; there is no
/// capacity bound. Expired entries are purged lazily when read.
#[derive(Default)]
pub struct ResponseCache {
  entries: Mutex<HashMap<String, ErasedEntry>>,
}

impl ResponseCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, ErasedEntry>> {
    // Mutations never panic midway, so a poisoned map is still consistent
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Get a cached value, or `None` if it was never set or has expired.
  pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
    let mut entries = self.entries();

    let valid = entries.get(key)?.is_valid_at(Instant::now());
    if !valid {
      entries.remove(key);
      debug!(key, "Cache entry expired");
      return None;
    }

    let entry = entries.get(key)?;
    match entry.data.downcast_ref::<T>() {
      Some(data) => Some(data.clone()),
      None => {
        warn!(key, "Cache entry has unexpected type");
        None
      }
    }
  }

  /// Store a value that stays valid for `ttl`.
  pub fn set<T: Send + Sync + 'static>(&self, key: &str, data: T, ttl: Duration) {
    let entry = CacheEntry::new(Box::new(data) as Box<dyn Any + Send + Sync>, ttl);
    self.entries().insert(key.to_string(), entry);
  }

  pub fn invalidate(&self, key: &str) {
    if self.entries().remove(key).is_some() {
      debug!(key, "Cache entry invalidated");
    }
  }

  /// Remove every entry whose key contains `pattern`.
  pub fn invalidate_pattern(&self, pattern: &str) {
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|key, _| !key.contains(pattern));
    debug!(pattern, removed = before - entries.len(), "Cache pattern invalidated");
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  /// Number of stored entries, including expired ones not yet purged.
  pub fn size(&self) -> usize {
    self.entries().len()
  }
}
