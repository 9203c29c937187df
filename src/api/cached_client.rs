//! PyKIDS client that wraps a [`Transport`] with caching, batching and
//! failure recovery.

use color_eyre::Result;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{
  paths, Analytics, LessonProgress, ProfileUpdate, ReplayRequest, UserProfile, UserProgress,
};
use super::Transport;
use crate::batch::{BatchCoalescer, FlushOutcome};
use crate::cache::{CacheCategory, CacheLayer, CacheResult};
use crate::connectivity::ConnectivityStatus;
use crate::error::{ErrorContext, ErrorRecord};
use crate::offline::{OfflineData, OfflineStore};
use crate::recovery::Recovery;

/// Outcome of a cache-first read.
#[derive(Debug)]
pub enum Fetch<T> {
  Ready(CacheResult<T>),
  /// The reader went away before the response arrived; nothing was cached
  Cancelled,
  /// The read failed. Retryable failures are already scheduled.
  Failed(ErrorRecord),
}

impl<T> Fetch<T> {
  pub fn ready(self) -> Option<CacheResult<T>> {
    match self {
      Self::Ready(result) => Some(result),
      _ => None,
    }
  }
}

/// Where a progress update went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
  /// Waiting in the batch coalescer
  Batched,
  /// Parked in the offline queue under this id
  Offline(String),
}

/// PyKIDS client with transparent caching and offline support.
///
/// Reads are served cache-first. Progress writes are coalesced per learner,
/// or parked offline while there is no connectivity. Every failure is
/// classified and handed to recovery instead of being returned raw.
#[derive(Clone)]
pub struct PyKidsClient {
  transport: Arc<dyn Transport>,
  cache: CacheLayer,
  batch: BatchCoalescer,
  recovery: Recovery,
  offline: Option<Arc<OfflineStore>>,
  connectivity: ConnectivityStatus,
}

impl PyKidsClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: CacheLayer,
    batch: BatchCoalescer,
    recovery: Recovery,
    offline: Option<Arc<OfflineStore>>,
    connectivity: ConnectivityStatus,
  ) -> Self {
    Self {
      transport,
      cache,
      batch,
      recovery,
      offline,
      connectivity,
    }
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  async fn read<T, F, Fut>(
    &self,
    category: CacheCategory,
    user_id: &str,
    liveness: &CancellationToken,
    request: ReplayRequest,
    fetcher: F,
  ) -> Fetch<T>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    match self.cache.fetch_one(category, user_id, liveness, fetcher).await {
      Ok(Some(result)) => Fetch::Ready(result),
      Ok(None) => Fetch::Cancelled,
      // A failure nobody is waiting for is not worth a retry
      Err(_) if liveness.is_cancelled() => Fetch::Cancelled,
      Err(e) => Fetch::Failed(
        self
          .recovery
          .handle(&e, Some(ErrorContext::Request(request))),
      ),
    }
  }

  /// Get a learner's profile with caching.
  pub async fn profile(&self, user_id: &str, liveness: &CancellationToken) -> Fetch<UserProfile> {
    let request = ReplayRequest::get(paths::profile(user_id));
    self
      .read(CacheCategory::Profile, user_id, liveness, request, || {
        let transport = Arc::clone(&self.transport);
        let user_id = user_id.to_string();
        async move { transport.fetch_profile(&user_id).await }
      })
      .await
  }

  /// Get a learner's progress with caching. A new learner gets empty progress.
  pub async fn progress(&self, user_id: &str, liveness: &CancellationToken) -> Fetch<UserProgress> {
    let request = ReplayRequest::get(paths::progress(user_id));
    self
      .read(CacheCategory::Progress, user_id, liveness, request, || {
        let transport = Arc::clone(&self.transport);
        let user_id = user_id.to_string();
        async move { transport.fetch_progress(&user_id).await }
      })
      .await
  }

  pub async fn analytics(&self, user_id: &str, liveness: &CancellationToken) -> Fetch<Analytics> {
    let request = ReplayRequest::get(paths::analytics(user_id));
    self
      .read(CacheCategory::Analytics, user_id, liveness, request, || {
        let transport = Arc::clone(&self.transport);
        let user_id = user_id.to_string();
        async move { transport.fetch_analytics(&user_id).await }
      })
      .await
  }

  /// Record a progress update. While offline it goes straight to the offline
  /// queue; otherwise it is batched.
  pub fn record_progress(&self, user_id: &str, update: LessonProgress) -> Result<Recorded> {
    if let (false, Some(offline)) = (self.connectivity.is_online(), &self.offline) {
      let id = offline.store_offline_data(OfflineData::Progress(update), Some(user_id))?;
      return Ok(Recorded::Offline(id));
    }

    self.batch.enqueue(user_id, update);
    Ok(Recorded::Batched)
  }

  /// Change a learner's avatar (not batched: a direct write).
  pub async fn update_avatar(
    &self,
    user_id: &str,
    avatar: &str,
  ) -> std::result::Result<UserProfile, ErrorRecord> {
    let update = ProfileUpdate {
      selected_avatar: Some(avatar.to_string()),
      ..Default::default()
    };

    match self.transport.update_profile(user_id, &update).await {
      Ok(profile) => {
        self
          .cache
          .cache()
          .invalidate(&CacheCategory::Profile.key(user_id));
        Ok(profile)
      }
      Err(e) => {
        let request = ReplayRequest::post(paths::profile(user_id), json!(update));
        Err(self.recovery.handle(&e, Some(ErrorContext::Request(request))))
      }
    }
  }

  /// Keep navigation history while offline. Online navigation is not
  /// recorded; returns the offline entry id when one was stored.
  pub fn record_navigation(&self, path: &str, user_id: Option<&str>) -> Result<Option<String>> {
    match (&self.offline, self.connectivity.is_online()) {
      (Some(offline), false) => {
        let id = offline.store_offline_data(OfflineData::Navigation(path.to_string()), user_id)?;
        Ok(Some(id))
      }
      _ => Ok(None),
    }
  }

  /// Send every pending batch and wait for the writes. Call before exit.
  pub async fn flush(&self) -> Vec<FlushOutcome> {
    self.batch.flush().await
  }

  /// Forget everything cached for a learner.
  pub fn logout(&self, user_id: &str) {
    debug!(user_id, "Dropping cached state");
    self
      .cache
      .cache()
      .invalidate_pattern(&format!("_{}", user_id));
  }
}
