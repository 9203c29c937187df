//! Cache layer that orchestrates cache-first reads with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::storage::ResponseCache;
use super::traits::{CacheCategory, CacheResult, CacheTtls};

/// Cache layer that sits between the client facade and the transport.
pub struct CacheLayer {
  cache: Arc<ResponseCache>,
  ttls: CacheTtls,
}

impl CacheLayer {
  pub fn new(cache: Arc<ResponseCache>, ttls: CacheTtls) -> Self {
    Self { cache, ttls }
  }

  pub fn cache(&self) -> &Arc<ResponseCache> {
    &self.cache
  }

  /// Fetch a single entity with a cache-first strategy.
  ///
  /// 1. Unexpired cache entry: return it without touching the network
  /// 2. Otherwise run `fetcher` and store its result under the category TTL
  ///
  /// `liveness` belongs to whoever asked for the data. If it is cancelled
  /// before the response arrives, the fetch is dropped, nothing is cached and
  /// `Ok(None)` is returned.
  pub async fn fetch_one<T, F, Fut>(
    &self,
    category: CacheCategory,
    entity_id: &str,
    liveness: &CancellationToken,
    fetcher: F,
  ) -> Result<Option<CacheResult<T>>>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let key = category.key(entity_id);

    if let Some(data) = self.cache.get::<T>(&key) {
      debug!(key = %key, "Cache hit");
      return Ok(Some(CacheResult::from_cache(data)));
    }

    debug!(key = %key, "Cache miss");
    let data = tokio::select! {
      biased;
      _ = liveness.cancelled() => {
        debug!(key = %key, "Read aborted before response arrived");
        return Ok(None);
      }
      result = fetcher() => result?,
    };

    // The owner may have gone away while we were being polled to completion
    if liveness.is_cancelled() {
      return Ok(None);
    }

    self
      .cache
      .set(&key, data.clone(), self.ttls.for_category(category));
    Ok(Some(CacheResult::from_network(data)))
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      ttls: self.ttls,
    }
  }
}
