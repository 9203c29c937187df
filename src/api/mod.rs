//! PyKIDS HTTP API: transport seam, reqwest implementation and the
//! cache-first client facade.

pub mod cached_client;
pub mod client;
pub mod identity;
pub mod types;

use async_trait::async_trait;
use color_eyre::Result;

use types::{Analytics, LessonProgress, ProfileUpdate, ReplayRequest, UserProfile, UserProgress};

/// Network operations the core depends on.
///
/// Error messages matter: they are classified by substring, so timeouts must
/// mention "timeout", rejected credentials "unauthorized", and so on.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile>;

  /// A learner the server has never seen yields empty progress, not an error.
  async fn fetch_progress(&self, user_id: &str) -> Result<UserProgress>;

  async fn batch_update_progress(&self, user_id: &str, updates: &[LessonProgress]) -> Result<()>;

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<UserProfile>;

  async fn fetch_analytics(&self, user_id: &str) -> Result<Analytics>;

  /// Send a previously captured request again.
  async fn replay(&self, request: &ReplayRequest) -> Result<()>;

  /// Lightweight reachability check.
  async fn probe(&self) -> Result<()>;
}
