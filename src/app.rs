//! Composition root: builds every component once and wires them together.

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::cached_client::PyKidsClient;
use crate::api::client::HttpTransport;
use crate::api::identity::{EnvIdentity, IdentityProvider};
use crate::api::Transport;
use crate::batch::{BatchCoalescer, FlushOutcome};
use crate::cache::{CacheLayer, ResponseCache};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::ErrorClassifier;
use crate::offline::{OfflineStore, Synchronizer};
use crate::recovery::Recovery;
use crate::retry::{RetryDispatcher, RetryScheduler};
use crate::store::{KvStore, MemoryStore, SqliteStore};
use crate::writer::ProgressWriter;

/// The resilience core with all of its parts.
pub struct Core {
  config: Config,
  transport: Arc<dyn Transport>,
  connectivity: Arc<ConnectivityMonitor>,
  classifier: Arc<ErrorClassifier>,
  offline: Option<Arc<OfflineStore>>,
  synchronizer: Option<Arc<Synchronizer>>,
  retry: RetryScheduler,
  client: PyKidsClient,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
  pub fn new(
    config: Config,
    store: Arc<dyn KvStore>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
  ) -> Result<Self> {
    let cache = Arc::new(ResponseCache::new());
    let connectivity = Arc::new(ConnectivityMonitor::new(true));
    let writer = ProgressWriter::new(Arc::clone(&transport), Arc::clone(&cache));

    let classifier = Arc::new(
      ErrorClassifier::new(Arc::clone(&store), config.retry.max_retries)?.with_identity(identity),
    );

    let offline = if config.offline.enabled {
      Some(Arc::new(OfflineStore::open(Arc::clone(&store))?))
    } else {
      None
    };
    let synchronizer = offline.as_ref().map(|offline| {
      Arc::new(Synchronizer::new(
        Arc::clone(offline),
        writer.clone(),
        connectivity.status(),
        config.offline.sync_policy,
      ))
    });

    let mut dispatcher = RetryDispatcher::new(writer.clone(), Arc::clone(&transport));
    if let Some(synchronizer) = &synchronizer {
      dispatcher = dispatcher.with_synchronizer(Arc::clone(synchronizer));
    }
    let retry = RetryScheduler::new(
      Arc::clone(&store),
      config.retry.policy(),
      dispatcher,
      connectivity.status(),
      offline.clone(),
    )?;

    let recovery = Recovery::new(Arc::clone(&classifier), retry.clone(), offline.clone());
    let batch = BatchCoalescer::new(writer, config.batch, Some(recovery.batch_failure_handler()));
    let client = PyKidsClient::new(
      Arc::clone(&transport),
      CacheLayer::new(cache, config.cache.ttls()),
      batch,
      recovery,
      offline.clone(),
      connectivity.status(),
    );

    Ok(Self {
      config,
      transport,
      connectivity,
      classifier,
      offline,
      synchronizer,
      retry,
      client,
      tasks: Mutex::new(Vec::new()),
    })
  }

  /// Build the core against the real API, with state in SQLite (or in
  /// memory when `ephemeral`). The token comes from the environment.
  pub fn from_config(config: Config, ephemeral: bool) -> Result<Self> {
    let store: Arc<dyn KvStore> = if ephemeral {
      Arc::new(MemoryStore::new())
    } else {
      Arc::new(SqliteStore::open(config.storage.path.as_deref())?)
    };
    let identity: Arc<dyn IdentityProvider> = Arc::new(EnvIdentity::new());
    let transport = Arc::new(HttpTransport::new(&config.api, Arc::clone(&identity))?);

    Self::new(config, store, transport, identity)
  }

  fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Resume persisted retries and start the background tasks. Must be called
  /// from within a tokio runtime.
  pub fn start(&self) {
    let resumed = self.retry.resume();

    let mut tasks = self.tasks();
    if let Some(synchronizer) = &self.synchronizer {
      tasks.push(
        self
          .connectivity
          .spawn_reconnect_sync(Arc::clone(synchronizer)),
      );
    }
    if let Some(interval) = self.config.connectivity.probe_interval() {
      tasks.push(
        self
          .connectivity
          .spawn_health_probe(Arc::clone(&self.transport), interval),
      );
    }
    info!(resumed, background_tasks = tasks.len(), "Core started");
  }

  /// Flush pending batches, then stop background work. Retries that are
  /// still queued stay persisted for the next start.
  pub async fn shutdown(&self) -> Vec<FlushOutcome> {
    let outcomes = self.client.flush().await;
    self.retry.shutdown();
    for task in self.tasks().drain(..) {
      task.abort();
    }
    debug!(flushed = outcomes.len(), "Core stopped");
    outcomes
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn client(&self) -> &PyKidsClient {
    &self.client
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  pub fn classifier(&self) -> &Arc<ErrorClassifier> {
    &self.classifier
  }

  pub fn retry(&self) -> &RetryScheduler {
    &self.retry
  }

  pub fn offline(&self) -> Option<&Arc<OfflineStore>> {
    self.offline.as_ref()
  }

  pub fn synchronizer(&self) -> Option<&Arc<Synchronizer>> {
    self.synchronizer.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::cached_client::Recorded;
  use crate::api::identity::StaticIdentity;
  use crate::api::types::LessonProgress;
  use crate::error::{ErrorContext, ErrorKind, ErrorRecord, Severity};
  use crate::testing::MockTransport;
  use std::time::Duration;

  fn config() -> Config {
    Config::parse("connectivity:\n  probe_interval_secs: 0\n").unwrap()
  }

  fn core(store: Arc<MemoryStore>, transport: Arc<MockTransport>) -> Core {
    Core::new(config(), store, transport, Arc::new(StaticIdentity::new("t"))).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_replays_offline_progress() {
    let transport = Arc::new(MockTransport::new());
    let core = core(Arc::new(MemoryStore::new()), transport.clone());
    core.start();

    core.connectivity().set_online(false);
    let recorded = core
      .client()
      .record_progress("u1", LessonProgress::new("basics", "variables", true))
      .unwrap();
    assert!(matches!(recorded, Recorded::Offline(_)));

    core.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.batch_calls().len(), 1);
    assert!(core.offline().unwrap().is_empty());
    core.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_flushes_pending_batches() {
    let transport = Arc::new(MockTransport::new());
    let core = core(Arc::new(MemoryStore::new()), transport.clone());
    core.start();

    core
      .client()
      .record_progress("u1", LessonProgress::new("basics", "loops", true))
      .unwrap();
    let outcomes = core.shutdown().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(transport.batch_calls().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_resumes_persisted_retries() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MockTransport::new());
    transport.fail_replays("server error (503)");

    let first = core(store.clone(), transport.clone());
    let record = ErrorRecord::new(
      ErrorKind::Api,
      Severity::Medium,
      "server error (503)",
      Some(ErrorContext::Request(crate::api::types::ReplayRequest::get("api/users/u1/profile"))),
      true,
      3,
    );
    first.retry().enqueue(record);
    first.shutdown().await;

    let healthy = Arc::new(MockTransport::new());
    let second = core(store, healthy.clone());
    assert_eq!(second.retry().len(), 1);
    second.start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(healthy.replay_calls().len(), 1);
    assert!(second.retry().is_empty());
  }

  #[test]
  fn test_offline_storage_can_be_disabled() {
    let config = Config::parse("offline:\n  enabled: false\n").unwrap();
    let core = Core::new(
      config,
      Arc::new(MemoryStore::new()),
      Arc::new(MockTransport::new()),
      Arc::new(StaticIdentity::new("t")),
    )
    .unwrap();

    assert!(core.offline().is_none());
    assert!(core.synchronizer().is_none());
  }
}
