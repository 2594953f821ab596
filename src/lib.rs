//! Tidepool: offline-first synchronization and caching engine.
//!
//! The engine lets a client keep serving reads and accepting writes while
//! disconnected, then reconciles once connectivity returns: a two-tier
//! response cache with conditional revalidation, durable offline queues,
//! a single-flight sync coordinator, and the request pipeline every
//! outgoing call goes through.
//!
//! [`Engine`] wires these together around one durable store. Components
//! are explicit injected instances; tests build fresh in-memory engines.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

pub use networking::{
    HttpTransport, HttpTransportConfig, Method, Request, Response, RetryConfig, Transport,
    TransportError,
};
pub use storage::{
    CacheConfig, CacheEntry, CacheError, CacheOptions, CacheStats, CacheStore, DurableStore,
    KvConfig, KvError, SledStore,
};
pub use sync_engine::{
    ActionKind, ActionStatus, ConnectivityEvent, ConnectivityMonitor, ConnectivityState,
    FetchOutcome, FetchSource, MutationOutcome, OfflineAction, OfflineStats, OfflineStore,
    PipelineConfig, PipelineError, QueueError, QueuedRequest, RequestPipeline, SyncConfig,
    SyncCoordinator, SyncError, SyncOutcome, SyncReport, TokenRefresher,
};

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Durable store could not be opened
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    /// Cache could not be initialized
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Transport could not be built
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Sync failure
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend endpoint prefix
    pub base_url: String,
    /// On-disk database path; `None` keeps everything in memory
    pub data_path: Option<PathBuf>,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Failed replay attempts before a queued item is abandoned
    pub max_retries: u32,
}

impl EngineConfig {
    /// In-memory engine (tests, ephemeral sessions)
    pub fn in_memory(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            data_path: None,
            cache: CacheConfig::api(),
            max_retries: 3,
        }
    }

    /// Engine persisted at `path`
    pub fn at_path(base_url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { data_path: Some(path.into()), ..Self::in_memory(base_url) }
    }

    /// Override the cache configuration
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Override the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// The assembled sync/cache engine
pub struct Engine {
    durable: Arc<dyn DurableStore>,
    cache: Arc<CacheStore>,
    offline: Arc<OfflineStore>,
    monitor: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    pipeline: RequestPipeline,
}

impl Engine {
    /// Build an engine over the reqwest transport
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let transport = Arc::new(HttpTransport::new(HttpTransportConfig::default())?);
        Self::with_transport(config, transport)
    }

    /// Build an engine over a caller-supplied transport
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        let durable: Arc<dyn DurableStore> = match &config.data_path {
            Some(path) => Arc::new(SledStore::new(KvConfig::new(path.to_string_lossy()))?),
            None => Arc::new(SledStore::in_memory()?),
        };

        let cache = Arc::new(CacheStore::new(config.cache.clone(), Arc::clone(&durable))?);
        let offline = Arc::new(OfflineStore::new(Arc::clone(&durable)));
        let monitor = Arc::new(ConnectivityMonitor::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&offline),
            Arc::clone(&transport),
            SyncConfig {
                base_url: config.base_url.clone(),
                max_retries: config.max_retries,
            },
        ));
        let pipeline = RequestPipeline::new(
            transport,
            Arc::clone(&cache),
            Arc::clone(&offline),
            Arc::clone(&monitor),
            PipelineConfig::new(config.base_url.clone()),
        );

        tracing::debug!(
            base_url = %config.base_url,
            persistent = config.data_path.is_some(),
            "engine assembled"
        );
        Ok(Self { durable, cache, offline, monitor, coordinator, pipeline })
    }

    /// Install a token refresher on the pipeline
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.pipeline = self.pipeline.with_refresher(refresher);
        self
    }

    /// The request pipeline every outgoing call should go through
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// The response cache
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// The offline queues and data cache
    pub fn offline(&self) -> &Arc<OfflineStore> {
        &self.offline
    }

    /// The connectivity monitor
    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Record that the network became reachable
    pub async fn set_online(&self) {
        self.monitor.set_state(ConnectivityState::Online).await;
    }

    /// Record that the network went away
    pub async fn set_offline(&self) {
        self.monitor.set_state(ConnectivityState::Offline).await;
    }

    /// Trigger a sync pass now.
    ///
    /// A no-op (`SyncOutcome::AlreadyRunning`) if a pass is in flight.
    pub async fn sync_now(&self) -> Result<SyncOutcome, EngineError> {
        Ok(self.coordinator.sync().await?)
    }

    /// Replay the queues automatically on every reconnect
    pub fn watch_connectivity(&self) -> JoinHandle<()> {
        Arc::clone(&self.coordinator).spawn_on_reconnect(&self.monitor)
    }

    /// Flush pending durable writes to disk
    pub fn flush(&self) -> Result<(), EngineError> {
        self.durable.flush()?;
        Ok(())
    }
}
