//! Connectivity state tracking

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, RwLock};

/// Network connectivity state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Connected to network
    Online,

    /// Disconnected from network
    Offline,

    /// Not yet determined
    Unknown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => write!(f, "online"),
            ConnectivityState::Offline => write!(f, "offline"),
            ConnectivityState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Emitted whenever the observed state actually changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    /// State before the change
    pub previous: ConnectivityState,
    /// State after the change
    pub current: ConnectivityState,
}

impl ConnectivityEvent {
    /// Whether this event is a transition onto the network
    pub fn is_reconnect(&self) -> bool {
        self.current == ConnectivityState::Online && self.previous != ConnectivityState::Online
    }
}

/// Tracks connectivity and broadcasts transitions
pub struct ConnectivityMonitor {
    state: RwLock<ConnectivityState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Create a monitor in the `Unknown` state
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self { state: RwLock::new(ConnectivityState::Unknown), events }
    }

    /// Current state
    pub async fn state(&self) -> ConnectivityState {
        *self.state.read().await
    }

    /// Whether we currently believe the network is reachable
    pub async fn is_online(&self) -> bool {
        self.state().await == ConnectivityState::Online
    }

    /// Record a state observation, emitting an event on actual change
    pub async fn set_state(&self, state: ConnectivityState) {
        let mut current = self.state.write().await;
        if *current != state {
            let event = ConnectivityEvent { previous: *current, current: state };
            *current = state;
            tracing::info!(from = %event.previous, to = %event.current, "connectivity changed");
            let _ = self.events.send(event);
        }
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_unknown() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.state().await, ConnectivityState::Unknown);
        assert!(!monitor.is_online().await);
    }

    #[tokio::test]
    async fn test_change_emits_event() {
        let monitor = ConnectivityMonitor::new();
        let mut events = monitor.subscribe();

        monitor.set_state(ConnectivityState::Online).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.previous, ConnectivityState::Unknown);
        assert_eq!(event.current, ConnectivityState::Online);
        assert!(event.is_reconnect());
    }

    #[tokio::test]
    async fn test_same_state_is_silent() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_state(ConnectivityState::Offline).await;

        let mut events = monitor.subscribe();
        monitor.set_state(ConnectivityState::Offline).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_to_online_is_reconnect() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_state(ConnectivityState::Offline).await;

        let mut events = monitor.subscribe();
        monitor.set_state(ConnectivityState::Online).await;

        assert!(events.recv().await.unwrap().is_reconnect());
    }

    #[tokio::test]
    async fn test_going_offline_is_not_reconnect() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_state(ConnectivityState::Online).await;

        let mut events = monitor.subscribe();
        monitor.set_state(ConnectivityState::Offline).await;

        assert!(!events.recv().await.unwrap().is_reconnect());
    }
}
