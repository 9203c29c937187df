//! Serde types matching the PyKIDS HTTP API.
//!
//! The backend aliases columns without quoting them, so Postgres folds the
//! camelCase names to lowercase (`selectedavatar`, `totalscore`). Both
//! spellings are accepted on input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One progress event for a lesson topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
  pub module_id: String,
  pub topic_id: String,
  pub completed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub score: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}

impl LessonProgress {
  pub fn new(module_id: impl Into<String>, topic_id: impl Into<String>, completed: bool) -> Self {
    Self {
      module_id: module_id.into(),
      topic_id: topic_id.into(),
      completed,
      score: None,
      completed_at: completed.then(Utc::now),
    }
  }

  pub fn with_score(mut self, score: u32) -> Self {
    self.score = Some(score);
    self
  }
}

/// Stored state of a single topic, as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicProgress {
  #[serde(default)]
  pub completed: bool,
  #[serde(default)]
  pub score: u32,
  /// Server-formatted timestamp; not always RFC 3339
  #[serde(default)]
  pub completed_at: Option<String>,
}

/// module id -> topic id -> progress
pub type ProgressMap = BTreeMap<String, BTreeMap<String, TopicProgress>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastActiveLesson {
  #[serde(alias = "moduleid")]
  pub module_id: String,
  #[serde(alias = "topicid")]
  pub topic_id: String,
}

/// A learner's profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub id: String,
  #[serde(default)]
  pub email: String,
  #[serde(default, alias = "selectedavatar")]
  pub selected_avatar: Option<String>,
  #[serde(default)]
  pub progress: ProgressMap,
  #[serde(default, alias = "totalscore")]
  pub total_score: i64,
  #[serde(default, alias = "createdat")]
  pub created_at: Option<String>,
  #[serde(default, alias = "lastactivelesson")]
  pub last_active_lesson: Option<LastActiveLesson>,
}

/// Progress for one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
  #[serde(alias = "userid")]
  pub user_id: String,
  #[serde(default)]
  pub progress: ProgressMap,
  #[serde(default, alias = "totalscore")]
  pub total_score: i64,
}

impl UserProgress {
  /// Progress for a learner the server has never seen.
  pub fn empty(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      progress: ProgressMap::new(),
      total_score: 0,
    }
  }

  pub fn is_topic_completed(&self, module_id: &str, topic_id: &str) -> bool {
    self
      .progress
      .get(module_id)
      .and_then(|topics| topics.get(topic_id))
      .map(|t| t.completed)
      .unwrap_or(false)
  }
}

/// Body for profile updates. Unset fields are left untouched by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub selected_avatar: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
}

/// Learner analytics. The shape is owned by the server.
pub type Analytics = Value;

/// Body of a batched progress write.
#[derive(Debug, Serialize)]
pub(crate) struct BatchProgressBody<'a> {
  pub updates: &'a [LessonProgress],
}

/// A request captured so it can be replayed verbatim later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
  pub method: String,
  /// Absolute, or relative to the configured API base
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl ReplayRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      body: None,
    }
  }

  pub fn post(url: impl Into<String>, body: Value) -> Self {
    Self {
      method: "POST".to_string(),
      url: url.into(),
      body: Some(body),
    }
  }
}

/// Relative API paths.
pub mod paths {
  pub fn profile(user_id: &str) -> String {
    format!("api/users/{}/profile", user_id)
  }

  pub fn progress(user_id: &str) -> String {
    format!("api/users/{}/progress", user_id)
  }

  pub fn progress_batch(user_id: &str) -> String {
    format!("api/users/{}/progress/batch", user_id)
  }

  pub fn analytics(user_id: &str) -> String {
    format!("api/users/{}/analytics", user_id)
  }
}
