//! The single write path for progress updates.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::api::types::LessonProgress;
use crate::api::Transport;
use crate::cache::{CacheCategory, ResponseCache};

/// Sends progress to the server and drops the cache entries it invalidates.
///
/// Batch flushes, retries and offline replay all go through here, so a
/// successful write always forces the next profile/progress read to refetch.
#[derive(Clone)]
pub struct ProgressWriter {
  transport: Arc<dyn Transport>,
  cache: Arc<ResponseCache>,
}

impl ProgressWriter {
  pub fn new(transport: Arc<dyn Transport>, cache: Arc<ResponseCache>) -> Self {
    Self { transport, cache }
  }

  pub async fn write(&self, owner_id: &str, updates: &[LessonProgress]) -> Result<()> {
    self
      .transport
      .batch_update_progress(owner_id, updates)
      .await?;

    // A progress write can change both the progress map and the profile totals
    self.cache.invalidate(&CacheCategory::Progress.key(owner_id));
    self.cache.invalidate(&CacheCategory::Profile.key(owner_id));
    debug!(owner_id, count = updates.len(), "Progress written");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::MockTransport;
  use std::time::Duration;

  #[tokio::test]
  async fn test_success_invalidates_owner_entries_only() {
    let transport = Arc::new(MockTransport::new());
    let cache = Arc::new(ResponseCache::new());
    let ttl = Duration::from_secs(60);
    cache.set(&CacheCategory::Profile.key("u1"), 1u32, ttl);
    cache.set(&CacheCategory::Progress.key("u1"), 2u32, ttl);
    cache.set(&CacheCategory::Analytics.key("u1"), 3u32, ttl);
    cache.set(&CacheCategory::Profile.key("u2"), 4u32, ttl);

    let writer = ProgressWriter::new(transport.clone(), cache.clone());
    writer
      .write("u1", &[LessonProgress::new("basics", "variables", true)])
      .await
      .unwrap();

    assert_eq!(cache.get::<u32>("profile_u1"), None);
    assert_eq!(cache.get::<u32>("progress_u1"), None);
    assert_eq!(cache.get::<u32>("analytics_u1"), Some(3));
    assert_eq!(cache.get::<u32>("profile_u2"), Some(4));
    assert_eq!(transport.batch_calls().len(), 1);
  }

  #[tokio::test]
  async fn test_failure_keeps_cache() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_batches("server error (503)");
    let cache = Arc::new(ResponseCache::new());
    cache.set("progress_u1", 2u32, Duration::from_secs(60));

    let writer = ProgressWriter::new(transport, cache.clone());
    assert!(writer
      .write("u1", &[LessonProgress::new("m", "t", true)])
      .await
      .is_err());
    assert_eq!(cache.get::<u32>("progress_u1"), Some(2));
  }
}
