//! Offline-first synchronization engine
//!
//! Connectivity tracking, durable offline queues, the coordinator that
//! replays them once the network returns, and the request pipeline every
//! outgoing call goes through.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connectivity;
pub mod coordinator;
pub mod pipeline;
pub mod queue;

pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState};
pub use coordinator::{SyncConfig, SyncCoordinator, SyncError, SyncOutcome, SyncReport};
pub use pipeline::{
    FetchOutcome, FetchSource, MutationOutcome, PipelineConfig, PipelineError, RequestPipeline,
    TokenRefresher,
};
pub use queue::{
    request_for_action, ActionKind, ActionStatus, OfflineAction, OfflineStats, OfflineStore,
    QueueError, QueuedRequest,
};
