use async_trait::async_trait;
use color_eyre::{eyre::eyre, Report, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::identity::IdentityProvider;
use super::types::{
  paths, Analytics, BatchProgressBody, LessonProgress, ProfileUpdate, ReplayRequest, UserProfile,
  UserProgress,
};
use super::Transport;
use crate::config::{ApiConfig, TimeoutConfig};

/// PyKIDS API client over reqwest, authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpTransport {
  http: reqwest::Client,
  base: Url,
  health_path: String,
  identity: Arc<dyn IdentityProvider>,
  timeouts: TimeoutConfig,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;
    // Relative joins drop the last segment unless the base ends with a slash
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    let http = reqwest::Client::builder()
      .connect_timeout(config.timeouts.default_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      health_path: config.health_path.trim_start_matches('/').to_string(),
      identity,
      timeouts: config.timeouts,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("invalid request path {}: {}", path, e))
  }

  async fn request(&self, method: Method, path: &str, timeout: Duration) -> Result<RequestBuilder> {
    let token = self
      .identity
      .current_bearer_token()
      .await
      .ok_or_else(|| eyre!("unauthorized: no bearer token available"))?;
    let url = self.endpoint(path)?;
    debug!(%method, %url, "Sending request");

    Ok(
      self
        .http
        .request(method, url)
        .bearer_auth(token)
        .timeout(timeout),
    )
  }

  /// Send and map transport and status failures into classifiable errors.
  async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
    let response = builder.send().await.map_err(|e| transport_error(e, what))?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, what, &body))
  }

  async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
      .json()
      .await
      .map_err(|e| eyre!("invalid response body for {}: {}", what, e))
  }
}

fn transport_error(e: reqwest::Error, what: &str) -> Report {
  if e.is_timeout() {
    eyre!("network timeout while requesting {}: {}", what, e)
  } else if e.is_connect() || e.is_request() {
    eyre!("network unavailable while requesting {}: {}", what, e)
  } else {
    eyre!("network error while requesting {}: {}", what, e)
  }
}

/// Error for a non-success status. The wording picks the error kind.
/// Failure label for a batched write. Must not contain classifier keywords
/// such as "progress" or "update", or every status would classify alike.
fn batch_label(user_id: &str, count: usize) -> String {
  format!("lesson batch of {} ({} entries)", user_id, count)
}

pub(crate) fn status_error(status: StatusCode, what: &str, body: &str) -> Report {
  let code = status.as_u16();
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
      eyre!("unauthorized ({}) for {}: {}", code, what, body)
    }
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
      eyre!("invalid request ({}) for {}: {}", code, what, body)
    }
    StatusCode::NOT_FOUND => eyre!("{} not found ({})", what, code),
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
      eyre!("timeout ({}) for {}", code, what)
    }
    s if s.is_server_error() => eyre!("server error ({}) for {}: {}", code, what, body),
    _ => eyre!("api error ({}) for {}: {}", code, what, body),
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
    let what = format!("profile of {}", user_id);
    let request = self
      .request(Method::GET, &paths::profile(user_id), self.timeouts.default_timeout())
      .await?;
    let response = self.send(request, &what).await?;
    Self::json(response, &what).await
  }

  async fn fetch_progress(&self, user_id: &str) -> Result<UserProgress> {
    // Avoid "progress" in the label: it would outrank auth and server rules
    let what = format!("lesson record of {}", user_id);
    let request = self
      .request(Method::GET, &paths::progress(user_id), self.timeouts.default_timeout())
      .await?;
    let response = request.send().await.map_err(|e| transport_error(e, &what))?;

    if response.status() == StatusCode::NOT_FOUND {
      debug!(user_id, "No lesson record yet, treating as a new learner");
      return Ok(UserProgress::empty(user_id));
    }
    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(status_error(status, &what, &body));
    }

    Self::json(response, &what).await
  }

  async fn batch_update_progress(&self, user_id: &str, updates: &[LessonProgress]) -> Result<()> {
    let what = batch_label(user_id, updates.len());
    let request = self
      .request(
        Method::POST,
        &paths::progress_batch(user_id),
        self.timeouts.batch_timeout(),
      )
      .await?
      .json(&BatchProgressBody { updates });
    self.send(request, &what).await?;
    Ok(())
  }

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<UserProfile> {
    let what = format!("profile of {}", user_id);
    let request = self
      .request(
        Method::POST,
        &paths::profile(user_id),
        self.timeouts.upload_timeout(),
      )
      .await?
      .json(update);
    let response = self.send(request, &what).await?;
    Self::json(response, &what).await
  }

  async fn fetch_analytics(&self, user_id: &str) -> Result<Analytics> {
    let what = format!("analytics of {}", user_id);
    let request = self
      .request(
        Method::GET,
        &paths::analytics(user_id),
        self.timeouts.default_timeout(),
      )
      .await?;
    let response = self.send(request, &what).await?;
    Self::json(response, &what).await
  }

  async fn replay(&self, request: &ReplayRequest) -> Result<()> {
    let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("invalid request method {}: {}", request.method, e))?;
    let timeout = if method == Method::GET {
      self.timeouts.default_timeout()
    } else {
      self.timeouts.upload_timeout()
    };

    // Not the url: it may contain "progress", which would outrank auth and validation
    let what = format!("replayed {} request", method);
    let mut builder = self.request(method, &request.url, timeout).await?;
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }
    self.send(builder, &what).await?;
    Ok(())
  }

  async fn probe(&self) -> Result<()> {
    // The health route is public; no bearer token needed
    let url = self.endpoint(&self.health_path)?;
    let response = self
      .http
      .get(url)
      .timeout(self.timeouts.default_timeout())
      .send()
      .await
      .map_err(|e| transport_error(e, "health probe"))?;

    if response.status().is_server_error() {
      return Err(eyre!(
        "network probe failed: server answered {}",
        response.status()
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::identity::StaticIdentity;
  use crate::error::{categorize, ErrorKind};

  #[test]
  fn test_status_errors_classify_by_kind() {
    let cases = [
      (StatusCode::UNAUTHORIZED, ErrorKind::Authentication),
      (StatusCode::FORBIDDEN, ErrorKind::Authentication),
      (StatusCode::BAD_REQUEST, ErrorKind::Validation),
      (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Api),
      (StatusCode::BAD_GATEWAY, ErrorKind::Api),
      (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Network),
      (StatusCode::NOT_FOUND, ErrorKind::Unknown),
    ];

    for (status, kind) in cases {
      let error = status_error(status, "profile of u1", "");
      let (classified, ..) = categorize(&error.to_string());
      assert_eq!(classified, kind, "{}", status);
    }
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let config = ApiConfig {
      url: "https://pykids.example.com/backend".to_string(),
      ..ApiConfig::default()
    };
    let transport = HttpTransport::new(&config, Arc::new(StaticIdentity::new("t"))).unwrap();

    assert_eq!(
      transport.endpoint(&paths::profile("u1")).unwrap().as_str(),
      "https://pykids.example.com/backend/api/users/u1/profile"
    );
  }

  #[test]
  fn test_absolute_replay_url_is_kept() {
    let transport =
      HttpTransport::new(&ApiConfig::default(), Arc::new(StaticIdentity::new("t"))).unwrap();
    assert_eq!(
      transport
        .endpoint("https://other.example.com/x")
        .unwrap()
        .as_str(),
      "https://other.example.com/x"
    );
  }

  #[tokio::test]
  async fn test_signed_out_requests_fail_as_unauthorized() {
    let transport =
      HttpTransport::new(&ApiConfig::default(), Arc::new(StaticIdentity::signed_out())).unwrap();

    let error = transport.fetch_analytics("u1").await.unwrap_err();
    let (kind, ..) = categorize(&error.to_string());
    assert_eq!(kind, ErrorKind::Authentication);
  }

  #[test]
  fn test_write_failures_classify_by_status() {
    let cases = [
      (StatusCode::UNAUTHORIZED, ErrorKind::Authentication),
      (StatusCode::FORBIDDEN, ErrorKind::Authentication),
      (StatusCode::BAD_REQUEST, ErrorKind::Validation),
      (StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Validation),
      (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Api),
      (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Network),
    ];

    for what in [batch_label("u1", 3), "replayed POST request".to_string()] {
      for (status, kind) in cases {
        let error = status_error(status, &what, "");
        let (classified, ..) = categorize(&error.to_string());
        assert_eq!(classified, kind, "{} for {}", status, what);
      }
    }
  }

  /// Answer a single request with `status_line` and no body.
  async fn serve_once(status_line: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      // Drain the whole request so closing the socket does not reset it
      let mut request = Vec::new();
      let mut buf = [0u8; 4096];
      loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
          break;
        }
        request.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&request).to_lowercase();
        if let Some(end) = text.find("\r\n\r\n") {
          let body_len = text[..end]
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
          if request.len() >= end + 4 + body_len {
            break;
          }
        }
      }
      let response = format!(
        "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        status_line
      );
      socket.write_all(response.as_bytes()).await.unwrap();
    });
    format!("http://{}/", addr)
  }

  fn transport_for(url: String, identity: Arc<StaticIdentity>) -> HttpTransport {
    let config = ApiConfig {
      url,
      ..ApiConfig::default()
    };
    HttpTransport::new(&config, identity).unwrap()
  }

  #[tokio::test]
  async fn test_rejected_batch_write_signals_identity() {
    use crate::error::{ErrorClassifier, Severity};
    use crate::store::{keys, KvStore, MemoryStore};

    let identity = Arc::new(StaticIdentity::new("stale"));
    let transport = transport_for(serve_once("401 Unauthorized").await, identity.clone());
    let error = transport
      .batch_update_progress("u1", &[LessonProgress::new("basics", "loops", true)])
      .await
      .unwrap_err();

    let store = Arc::new(MemoryStore::new());
    store.set_item(keys::AUTH_STATE[0], "stale").unwrap();
    let classifier = ErrorClassifier::new(store.clone(), 3)
      .unwrap()
      .with_identity(identity.clone());
    let record = classifier.classify(&error, None);

    assert_eq!(record.kind, ErrorKind::Authentication);
    assert_eq!(record.severity, Severity::Critical);
    assert!(!record.retryable);
    assert!(identity.failed());
    assert_eq!(store.get_item(keys::AUTH_STATE[0]).unwrap(), None);
  }

  #[tokio::test]
  async fn test_missing_progress_is_empty_not_an_error() {
    let identity = Arc::new(StaticIdentity::new("t"));
    let transport = transport_for(serve_once("404 Not Found").await, identity);

    let progress = transport.fetch_progress("u1").await.unwrap();
    assert_eq!(progress, UserProgress::empty("u1"));
  }
}
