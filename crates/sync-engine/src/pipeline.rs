//! The per-call decision layer.
//!
//! Every outgoing call goes through the pipeline. Reads consult the cache
//! and fall back to it when the network is unreachable; writes issued
//! while offline are queued and reported optimistically. The caller of an
//! offline write never sees an error at call time; the real outcome is
//! only visible later through the queue stats.

use crate::connectivity::ConnectivityMonitor;
use crate::queue::{request_for_action, ActionKind, OfflineStore, QueueError};
use async_trait::async_trait;
use networking::{retry_transient, Request, Response, RetryConfig, Transport, TransportError};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use storage::{CacheError, CacheOptions, CacheStore};
use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Offline with no usable cached copy
    #[error("offline and no cached data for {0}")]
    NoCachedData(String),

    /// The action cannot be mapped to an endpoint
    #[error("action against {entity} has no usable endpoint")]
    InvalidAction {
        /// Entity the action targeted
        entity: String,
    },

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Cache failure
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Queue failure
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Where a read result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fresh network response
    Network,
    /// Server confirmed the cached copy is current (304)
    NotModified,
    /// Served from the response cache without reaching the server
    Cache,
    /// Served from the offline data cache
    OfflineCache,
}

/// A read result with its provenance
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Response body
    pub data: Value,
    /// Where the body came from
    pub source: FetchSource,
}

/// A write result
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    /// Performed against the network
    Completed(Response),
    /// Recorded for replay; the caller should treat this as success
    Queued {
        /// Queue id of the recorded operation
        id: String,
    },
}

/// Supplies a fresh authorization header value after an auth failure
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Obtain a new `Authorization` header value
    async fn refresh(&self) -> std::result::Result<String, TransportError>;
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Endpoint prefix for semantic actions performed online
    pub base_url: String,
    /// Backoff window for idempotent reads
    pub retry: RetryConfig,
}

impl PipelineConfig {
    /// Configuration with the default read retry window
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), retry: RetryConfig::default() }
    }
}

/// The single decision point for outgoing calls
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
    offline: Arc<OfflineStore>,
    monitor: Arc<ConnectivityMonitor>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    config: PipelineConfig,
}

impl RequestPipeline {
    /// Create a pipeline over the given collaborators
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<CacheStore>,
        offline: Arc<OfflineStore>,
        monitor: Arc<ConnectivityMonitor>,
        config: PipelineConfig,
    ) -> Self {
        Self { transport, cache, offline, monitor, refresher: None, config }
    }

    /// Install a token refresher for the retry-once auth contract
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Fingerprint a request for cache keying.
    ///
    /// Deterministic over method, URL, and body, so the same logical read
    /// always lands on the same cache entry.
    pub fn fingerprint(request: &Request) -> String {
        let mut hasher = DefaultHasher::new();
        request.method.as_str().hash(&mut hasher);
        request.url.hash(&mut hasher);
        if let Some(body) = &request.body {
            body.to_string().hash(&mut hasher);
        }
        format!("{}:{:x}", request.method.as_str(), hasher.finish())
    }

    /// Read through the cache with conditional revalidation.
    ///
    /// Online, the call goes out with `If-None-Match`/`If-Modified-Since`
    /// attached when validators are cached; a 304 serves the cached body,
    /// a fresh response replaces it. Offline (or when the network fails
    /// mid-call), the cached copy is served instead; with nothing cached
    /// the read fails with [`PipelineError::NoCachedData`].
    pub async fn fetch(&self, request: Request, ttl: Option<Duration>) -> Result<FetchOutcome> {
        let key = Self::fingerprint(&request);

        if !self.monitor.is_online().await {
            return self.serve_offline(&key);
        }

        let mut conditional = request.clone();
        if let Some(etag) = self.cache.get_etag(&key)? {
            conditional = conditional.header("If-None-Match", etag);
        }
        if let Some(last_modified) = self.cache.get_last_modified(&key)? {
            conditional = conditional.header("If-Modified-Since", last_modified);
        }

        match self.execute_read(&conditional).await {
            Ok(response) if response.is_not_modified() => {
                match self.cache.get(&key)? {
                    Some(data) => {
                        tracing::debug!(key = %key, "server confirmed cached copy");
                        Ok(FetchOutcome { data, source: FetchSource::NotModified })
                    }
                    // The entry expired between the validator read and the
                    // response; ask again without validators.
                    None => {
                        let response = self.execute_read(&request).await?;
                        self.store_response(&key, &response, ttl)?;
                        Ok(FetchOutcome {
                            data: response.body.unwrap_or(Value::Null),
                            source: FetchSource::Network,
                        })
                    }
                }
            }
            Ok(response) => {
                self.store_response(&key, &response, ttl)?;
                Ok(FetchOutcome {
                    data: response.body.unwrap_or(Value::Null),
                    source: FetchSource::Network,
                })
            }
            Err(PipelineError::Transport(err)) if err.is_retryable() => {
                // The network went away under us; prefer stale data over
                // an error if we have any.
                tracing::debug!(key = %key, %err, "network failed, trying cache");
                match self.serve_offline(&key) {
                    Ok(outcome) => Ok(outcome),
                    Err(PipelineError::NoCachedData(_)) => Err(err.into()),
                    Err(other) => Err(other),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Perform a mutating request, queueing the literal request when
    /// offline
    pub async fn mutate(&self, request: Request) -> Result<MutationOutcome> {
        if !self.monitor.is_online().await {
            let id = self.offline.enqueue_request(&request)?;
            return Ok(MutationOutcome::Queued { id });
        }

        let response = self.execute_with_auth_retry(request).await?;
        Ok(MutationOutcome::Completed(response))
    }

    /// Perform a semantic mutation, queueing an action when offline
    pub async fn mutate_action(
        &self,
        kind: ActionKind,
        entity: &str,
        payload: Value,
    ) -> Result<MutationOutcome> {
        if !self.monitor.is_online().await {
            let id = self.offline.enqueue_action(kind, entity, payload)?;
            return Ok(MutationOutcome::Queued { id });
        }

        let request = request_for_action(&self.config.base_url, kind, entity, &payload)
            .ok_or_else(|| PipelineError::InvalidAction { entity: entity.to_string() })?;
        let response = self.execute_with_auth_retry(request).await?;
        Ok(MutationOutcome::Completed(response))
    }

    /// Backoff-wrapped read, honoring the retry-once auth contract.
    ///
    /// Reads are idempotent, so transient failures back off and retry
    /// within the configured window.
    async fn execute_read(&self, request: &Request) -> Result<Response> {
        match retry_transient(&self.config.retry, || self.transport.execute(request.clone())).await
        {
            Err(err) if err.is_auth() => {
                let Some(refresher) = &self.refresher else {
                    return Err(err.into());
                };
                let token = refresher.refresh().await?;
                tracing::debug!(url = %request.url, "retrying read with refreshed credentials");
                let refreshed = request.clone().header("Authorization", token);
                Ok(retry_transient(&self.config.retry, || {
                    self.transport.execute(refreshed.clone())
                })
                .await?)
            }
            other => Ok(other?),
        }
    }

    fn serve_offline(&self, key: &str) -> Result<FetchOutcome> {
        if let Some(data) = self.cache.get(key)? {
            return Ok(FetchOutcome { data, source: FetchSource::Cache });
        }
        if let Some(data) = self.offline.get_cached_data(key)? {
            return Ok(FetchOutcome { data, source: FetchSource::OfflineCache });
        }
        Err(PipelineError::NoCachedData(key.to_string()))
    }

    fn store_response(&self, key: &str, response: &Response, ttl: Option<Duration>) -> Result<()> {
        let Some(body) = &response.body else {
            return Ok(());
        };
        let mut opts = CacheOptions::default().persist();
        if let Some(ttl) = ttl {
            opts = opts.ttl(ttl);
        }
        if let Some(etag) = &response.etag {
            opts = opts.etag(etag.clone());
        }
        if let Some(last_modified) = &response.last_modified {
            opts = opts.last_modified(last_modified.clone());
        }
        self.cache.set(key, body.clone(), opts)?;
        Ok(())
    }

    /// One transparent token-refresh-and-retry before surfacing an auth
    /// failure
    async fn execute_with_auth_retry(&self, request: Request) -> Result<Response> {
        match self.transport.execute(request.clone()).await {
            Err(err) if err.is_auth() => {
                let Some(refresher) = &self.refresher else {
                    return Err(err.into());
                };
                let token = refresher.refresh().await?;
                tracing::debug!(url = %request.url, "retrying once with refreshed credentials");
                Ok(self
                    .transport
                    .execute(request.header("Authorization", token))
                    .await?)
            }
            other => Ok(other?),
        }
    }
}
