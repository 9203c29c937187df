//! Scriptable transport for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::types::{
  Analytics, LessonProgress, ProfileUpdate, ReplayRequest, UserProfile, UserProgress,
};
use crate::api::Transport;

#[derive(Default)]
struct Failure {
  message: Option<String>,
  /// `None` fails forever
  remaining: Option<usize>,
}

impl Failure {
  fn set(&mut self, message: &str, times: Option<usize>) {
    self.message = Some(message.to_string());
    self.remaining = times;
  }

  fn check(&mut self) -> Result<()> {
    let Some(message) = self.message.clone() else {
      return Ok(());
    };
    match &mut self.remaining {
      Some(0) => {
        self.message = None;
        Ok(())
      }
      Some(n) => {
        *n -= 1;
        Err(eyre!(message))
      }
      None => Err(eyre!(message)),
    }
  }
}

#[derive(Default)]
pub struct MockTransport {
  batches: Mutex<Vec<(String, Vec<LessonProgress>)>>,
  replays: Mutex<Vec<ReplayRequest>>,
  probes: AtomicUsize,
  reads: AtomicUsize,
  batch_failure: Mutex<Failure>,
  probe_failure: Mutex<Failure>,
  replay_failure: Mutex<Failure>,
  read_failure: Mutex<Failure>,
  latency: Mutex<Duration>,
}

impl MockTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_batches(&self, message: &str) {
    self.batch_failure.lock().unwrap().set(message, None);
  }

  pub fn fail_batches_times(&self, times: usize, message: &str) {
    self.batch_failure.lock().unwrap().set(message, Some(times));
  }

  pub fn succeed_batches(&self) {
    *self.batch_failure.lock().unwrap() = Failure::default();
  }

  pub fn fail_probes(&self, message: &str) {
    self.probe_failure.lock().unwrap().set(message, None);
  }

  pub fn fail_replays(&self, message: &str) {
    self.replay_failure.lock().unwrap().set(message, None);
  }

  pub fn fail_reads(&self, message: &str) {
    self.read_failure.lock().unwrap().set(message, None);
  }

  /// Delay every batch write by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Every batch write attempt, successful or not, in call order.
  pub fn batch_calls(&self) -> Vec<(String, Vec<LessonProgress>)> {
    self.batches.lock().unwrap().clone()
  }

  pub fn replay_calls(&self) -> Vec<ReplayRequest> {
    self.replays.lock().unwrap().clone()
  }

  pub fn probe_count(&self) -> usize {
    self.probes.load(Ordering::SeqCst)
  }

  pub fn read_count(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  fn read(&self) -> Result<()> {
    self.reads.fetch_add(1, Ordering::SeqCst);
    self.read_failure.lock().unwrap().check()
  }
}

pub fn profile(user_id: &str) -> UserProfile {
  UserProfile {
    id: user_id.to_string(),
    email: format!("{}@example.com", user_id),
    selected_avatar: Some("robot".to_string()),
    progress: Default::default(),
    total_score: 0,
    created_at: None,
    last_active_lesson: None,
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
    self.read()?;
    Ok(profile(user_id))
  }

  async fn fetch_progress(&self, user_id: &str) -> Result<UserProgress> {
    self.read()?;
    Ok(UserProgress::empty(user_id))
  }

  async fn batch_update_progress(&self, user_id: &str, updates: &[LessonProgress]) -> Result<()> {
    self
      .batches
      .lock()
      .unwrap()
      .push((user_id.to_string(), updates.to_vec()));

    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    self.batch_failure.lock().unwrap().check()
  }

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<UserProfile> {
    self.read()?;
    let mut updated = profile(user_id);
    updated.selected_avatar = update.selected_avatar.clone();
    Ok(updated)
  }

  async fn fetch_analytics(&self, user_id: &str) -> Result<Analytics> {
    self.read()?;
    Ok(serde_json::json!({ "userId": user_id, "lessonsCompleted": 0 }))
  }

  async fn replay(&self, request: &ReplayRequest) -> Result<()> {
    self.replays.lock().unwrap().push(request.clone());
    self.replay_failure.lock().unwrap().check()
  }

  async fn probe(&self) -> Result<()> {
    self.probes.fetch_add(1, Ordering::SeqCst);
    self.probe_failure.lock().unwrap().check()
  }
}
