//! Response caching for profile, progress and analytics reads.
//!
//! This module provides:
//! - An in-memory map of cache key to value with a per-category TTL
//! - Lazy purge of expired entries on read
//! - A cache-first fetch helper that refuses to commit responses for readers
//!   that have gone away
//!
//! The cache is intentionally volatile: a restart means a fresh fetch.

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::ResponseCache;
pub use traits::{CacheCategory, CacheEntry, CacheResult, CacheSource, CacheTtls};
