//! Core types for the response cache.

use std::time::Duration;
use tokio::time::Instant;

/// Category of cached server data. Each category has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
  Profile,
  Progress,
  Analytics,
}

impl CacheCategory {
  pub fn tag(self) -> &'static str {
    match self {
      Self::Profile => "profile",
      Self::Progress => "progress",
      Self::Analytics => "analytics",
    }
  }

  /// Cache key for an entity of this category, e.g. `profile_u42`.
  pub fn key(self, entity_id: &str) -> String {
    format!("{}_{}", self.tag(), entity_id)
  }
}

/// Time-to-live for each cache category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
  pub profile: Duration,
  pub progress: Duration,
  pub analytics: Duration,
}

impl Default for CacheTtls {
  fn default() -> Self {
    Self {
      profile: Duration::from_secs(5 * 60),
      progress: Duration::from_secs(2 * 60),
      analytics: Duration::from_secs(10 * 60),
    }
  }
}

impl CacheTtls {
  pub fn for_category(&self, category: CacheCategory) -> Duration {
    match category {
      CacheCategory::Profile => self.profile,
      CacheCategory::Progress => self.progress,
      CacheCategory::Analytics => self.analytics,
    }
  }
}

/// A cached value with its validity window.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub data: T,
  pub stored_at: Instant,
  pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, ttl: Duration) -> Self {
    let stored_at = Instant::now();
    Self {
      data,
      stored_at,
      expires_at: stored_at + ttl,
    }
  }

  /// An entry is valid up to and including its expiry instant.
  pub fn is_valid_at(&self, now: Instant) -> bool {
    now <= self.expires_at
  }
}

/// Result from a cache-first read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Unexpired cached data
  Cache,
}
