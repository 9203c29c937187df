//! Bearer-token source. Login and token refresh live in the identity service;
//! the core only asks for the current token and reports when it was rejected.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
  /// The bearer token to attach to the next request, if signed in.
  async fn current_bearer_token(&self) -> Option<String>;

  /// Called when a critical authentication failure was classified.
  fn authentication_failed(&self) {}
}

/// Reads the token from the environment on every request.
///
/// Checks PYKIDS_TOKEN first, then PYKIDS_ID_TOKEN as fallback.
#[derive(Debug, Default)]
pub struct EnvIdentity {
  rejected: AtomicBool,
}

impl EnvIdentity {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl IdentityProvider for EnvIdentity {
  async fn current_bearer_token(&self) -> Option<String> {
    std::env::var("PYKIDS_TOKEN")
      .or_else(|_| std::env::var("PYKIDS_ID_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }

  fn authentication_failed(&self) {
    if !self.rejected.swap(true, Ordering::SeqCst) {
      warn!("Token was rejected; set a fresh PYKIDS_TOKEN and sign in again");
    }
  }
}

/// Fixed token, for tests and scripted runs.
#[derive(Debug)]
pub struct StaticIdentity {
  token: Option<String>,
  failed: AtomicBool,
}

impl StaticIdentity {
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      token: Some(token.into()),
      failed: AtomicBool::new(false),
    }
  }

  pub fn signed_out() -> Self {
    Self {
      token: None,
      failed: AtomicBool::new(false),
    }
  }

  /// Whether an authentication failure was reported.
  pub fn failed(&self) -> bool {
    self.failed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
  async fn current_bearer_token(&self) -> Option<String> {
    self.token.clone()
  }

  fn authentication_failed(&self) {
    self.failed.store(true, Ordering::SeqCst);
  }
}
