//! Sync pass orchestration.
//!
//! A pass replays the literal request queue first, then pending semantic
//! actions, both oldest-first over snapshots taken when the pass starts.
//! Items enqueued mid-pass wait for the next pass. Only one pass runs at
//! a time: triggers raced against a running pass are dropped, not queued.

use crate::connectivity::ConnectivityMonitor;
use crate::queue::{request_for_action, OfflineStore, QueueError};
use networking::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Queue storage failure
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync pass configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Endpoint prefix semantic actions are replayed against
    pub base_url: String,
    /// Failed attempts before an item is abandoned
    pub max_retries: u32,
}

impl SyncConfig {
    /// Configuration with the default retry budget
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), max_retries: 3 }
    }
}

/// What a sync trigger did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A full pass ran
    Completed(SyncReport),
    /// Another pass was already in flight; this trigger was dropped
    AlreadyRunning,
}

/// Per-pass counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Requests replayed successfully
    pub requests_replayed: usize,
    /// Requests that failed this pass (kept for retry or dropped)
    pub requests_failed: usize,
    /// Actions replayed successfully
    pub actions_replayed: usize,
    /// Actions that failed this pass (kept for retry or marked failed)
    pub actions_failed: usize,
}

/// Serializes replay of the offline queues
pub struct SyncCoordinator {
    offline: Arc<OfflineStore>,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    in_flight: AtomicBool,
}

impl SyncCoordinator {
    /// Create a coordinator over the given queues and transport
    pub fn new(
        offline: Arc<OfflineStore>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> Self {
        Self { offline, transport, config, in_flight: AtomicBool::new(false) }
    }

    /// Run a sync pass unless one is already in flight
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("sync already in flight, dropping trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let result = self.run_pass().await;
        self.in_flight.store(false, Ordering::SeqCst);

        let report = result?;
        tracing::info!(?report, "sync pass finished");
        Ok(SyncOutcome::Completed(report))
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        // The request queue drains fully before actions start.
        for queued in self.offline.queued_requests()? {
            match self.transport.execute(queued.to_request()).await {
                Ok(_) => {
                    self.offline.remove_request(&queued.id)?;
                    report.requests_replayed += 1;
                }
                Err(err) if err.is_retryable() || err.is_auth() => {
                    self.offline
                        .record_request_failure(&queued.id, self.config.max_retries)?;
                    report.requests_failed += 1;
                }
                Err(err) => {
                    // The literal request can never succeed; drop it
                    // without consuming retries.
                    tracing::warn!(id = %queued.id, %err, "dropping permanently rejected request");
                    self.offline.remove_request(&queued.id)?;
                    report.requests_failed += 1;
                }
            }
        }

        for action in self.offline.pending_actions()? {
            let Some(request) = request_for_action(
                &self.config.base_url,
                action.kind,
                &action.entity,
                &action.payload,
            ) else {
                tracing::warn!(id = %action.id, "action has no replayable endpoint, marking failed");
                self.offline.mark_failed(&action.id)?;
                report.actions_failed += 1;
                continue;
            };

            match self.transport.execute(request).await {
                Ok(_) => {
                    self.offline.mark_synced(&action.id)?;
                    report.actions_replayed += 1;
                }
                Err(err) if err.is_retryable() || err.is_auth() => {
                    self.offline
                        .record_action_failure(&action.id, self.config.max_retries)?;
                    report.actions_failed += 1;
                }
                Err(err) => {
                    tracing::warn!(id = %action.id, %err, "action permanently rejected");
                    self.offline.mark_failed(&action.id)?;
                    report.actions_failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Watch `monitor` and run a pass on every offline-to-online transition
    pub fn spawn_on_reconnect(self: Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let mut events = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.is_reconnect() => {
                        if let Err(err) = self.sync().await {
                            tracing::error!(%err, "reconnect sync failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "connectivity events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
