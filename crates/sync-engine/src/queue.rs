//! Durable offline queues and the offline data cache.
//!
//! Work that cannot be performed while disconnected is recorded here and
//! replayed later by the coordinator. Two queue shapes exist: semantic
//! actions (create/update/delete against a named entity) and literal HTTP
//! requests. A single logical operation lands in exactly one of them.
//!
//! Actions keep an audit trail: replayed ones flip to `Synced`, exhausted
//! ones to `Failed`, and both are kept for inspection. Queued requests
//! have no status; presence means pending, removal means done or
//! abandoned.

use networking::{Method, Request};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storage::{DurableStore, KvError};
use thiserror::Error;

/// Durable collection holding [`OfflineAction`] records.
const ACTIONS: &str = "offline_actions";
/// Durable collection holding [`QueuedRequest`] records.
const REQUESTS: &str = "offline_queue";
/// Durable collection for the offline read cache.
const DATA: &str = "offline_data";

/// Offline queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Referenced record does not exist
    #[error("no such record: {0}")]
    NotFound(String),
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What a queued action does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a new record
    Create,
    /// Update an existing record
    Update,
    /// Delete a record
    Delete,
}

/// Lifecycle of a queued action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for replay
    Pending,
    /// Replayed successfully; kept for inspection
    Synced,
    /// Retries exhausted or permanently rejected; never retried again
    Failed,
}

/// A semantic mutation recorded while offline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineAction {
    /// Queue-assigned id
    pub id: String,
    /// Operation kind
    pub kind: ActionKind,
    /// Entity collection the operation targets (e.g. "tasks")
    pub entity: String,
    /// Operation payload
    pub payload: Value,
    /// When the action was recorded (epoch milliseconds)
    pub queued_at: u64,
    /// Replay state
    pub status: ActionStatus,
    /// Failed replay attempts so far
    pub retry_count: u32,
}

/// A literal HTTP request recorded while offline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Queue-assigned id
    pub id: String,
    /// Absolute URL
    pub url: String,
    /// HTTP method
    pub method: Method,
    /// JSON body, if any
    pub body: Option<Value>,
    /// Headers valid at enqueue time, including authorization
    pub headers: HashMap<String, String>,
    /// When the request was recorded (epoch milliseconds)
    pub queued_at: u64,
    /// Failed replay attempts so far
    pub retry_count: u32,
}

impl QueuedRequest {
    /// Rebuild the request to reissue
    pub fn to_request(&self) -> Request {
        let mut request = Request::new(self.method, self.url.clone());
        request.headers = self.headers.clone();
        request.body = self.body.clone();
        request
    }
}

/// Map a semantic action to its HTTP request.
///
/// `Update` and `Delete` address the record through `payload["id"]`; an
/// action without one has no endpoint and can never be replayed. A delete
/// carries no body.
pub fn request_for_action(
    base_url: &str,
    kind: ActionKind,
    entity: &str,
    payload: &Value,
) -> Option<Request> {
    let base = base_url.trim_end_matches('/');
    match kind {
        ActionKind::Create => {
            Some(Request::post(format!("{}/{}", base, entity)).body(payload.clone()))
        }
        ActionKind::Update => {
            let id = payload.get("id").and_then(Value::as_str)?;
            Some(Request::put(format!("{}/{}/{}", base, entity, id)).body(payload.clone()))
        }
        ActionKind::Delete => {
            let id = payload.get("id").and_then(Value::as_str)?;
            Some(Request::delete(format!("{}/{}/{}", base, entity, id)))
        }
    }
}

/// Queue and cache counters for user-facing visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfflineStats {
    /// Actions waiting for replay
    pub pending_actions: usize,
    /// Literal requests waiting for replay
    pub queued_requests: usize,
    /// Entries in the offline data cache
    pub cached_items: usize,
    /// Actions that exhausted their retries
    pub failed_actions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct OfflineCacheEntry {
    data: Value,
    stored_at: u64,
    expires_at: u64,
}

/// Durable record of work that could not be performed while disconnected
pub struct OfflineStore {
    store: Arc<dyn DurableStore>,
    seq: AtomicU64,
}

impl OfflineStore {
    /// Create a store over the given durable backend
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store, seq: AtomicU64::new(0) }
    }

    // The sequence number is zero-padded so ids enqueued within the same
    // millisecond still sort in enqueue order.
    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}-{:06}", prefix, now_millis(), self.seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Record a semantic mutation for later replay
    pub fn enqueue_action(
        &self,
        kind: ActionKind,
        entity: impl Into<String>,
        payload: Value,
    ) -> Result<String> {
        let action = OfflineAction {
            id: self.next_id("act"),
            kind,
            entity: entity.into(),
            payload,
            queued_at: now_millis(),
            status: ActionStatus::Pending,
            retry_count: 0,
        };
        self.store
            .put(ACTIONS, &action.id, &serde_json::to_value(&action)?)?;
        tracing::debug!(id = %action.id, entity = %action.entity, "queued offline action");
        Ok(action.id)
    }

    /// Record a literal request for later replay
    pub fn enqueue_request(&self, request: &Request) -> Result<String> {
        let queued = QueuedRequest {
            id: self.next_id("req"),
            url: request.url.clone(),
            method: request.method,
            body: request.body.clone(),
            headers: request.headers.clone(),
            queued_at: now_millis(),
            retry_count: 0,
        };
        self.store
            .put(REQUESTS, &queued.id, &serde_json::to_value(&queued)?)?;
        tracing::debug!(id = %queued.id, url = %queued.url, "queued offline request");
        Ok(queued.id)
    }

    /// Pending actions, oldest first
    pub fn pending_actions(&self) -> Result<Vec<OfflineAction>> {
        let rows = self
            .store
            .get_all_by_index(ACTIONS, "status", &json!("pending"))?;
        let mut actions: Vec<OfflineAction> = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            actions.push(serde_json::from_value(value)?);
        }
        actions.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(actions)
    }

    /// Queued requests, oldest first
    pub fn queued_requests(&self) -> Result<Vec<QueuedRequest>> {
        let rows = self.store.get_all(REQUESTS)?;
        let mut requests: Vec<QueuedRequest> = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            requests.push(serde_json::from_value(value)?);
        }
        requests.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    /// Look up a single action
    pub fn get_action(&self, id: &str) -> Result<Option<OfflineAction>> {
        match self.store.get(ACTIONS, id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn update_action<F>(&self, id: &str, mutate: F) -> Result<OfflineAction>
    where
        F: FnOnce(&mut OfflineAction),
    {
        let raw = self
            .store
            .get(ACTIONS, id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut action: OfflineAction = serde_json::from_value(raw)?;
        mutate(&mut action);
        self.store.put(ACTIONS, id, &serde_json::to_value(&action)?)?;
        Ok(action)
    }

    /// Mark an action replayed
    pub fn mark_synced(&self, id: &str) -> Result<()> {
        self.update_action(id, |action| action.status = ActionStatus::Synced)?;
        Ok(())
    }

    /// Mark an action permanently failed
    pub fn mark_failed(&self, id: &str) -> Result<()> {
        self.update_action(id, |action| action.status = ActionStatus::Failed)?;
        tracing::warn!(id, "offline action marked failed");
        Ok(())
    }

    /// Count a failed replay attempt; flips to `Failed` at `max_retries`
    pub fn record_action_failure(&self, id: &str, max_retries: u32) -> Result<ActionStatus> {
        let action = self.update_action(id, |action| {
            action.retry_count += 1;
            if action.retry_count >= max_retries {
                action.status = ActionStatus::Failed;
            }
        })?;
        if action.status == ActionStatus::Failed {
            tracing::warn!(id, retries = action.retry_count, "offline action exhausted retries");
        }
        Ok(action.status)
    }

    /// Remove a replayed (or abandoned) request
    pub fn remove_request(&self, id: &str) -> Result<()> {
        self.store.delete(REQUESTS, id)?;
        Ok(())
    }

    /// Count a failed replay attempt; drops the request at `max_retries`.
    ///
    /// Returns whether the request was dropped.
    pub fn record_request_failure(&self, id: &str, max_retries: u32) -> Result<bool> {
        let raw = self
            .store
            .get(REQUESTS, id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut request: QueuedRequest = serde_json::from_value(raw)?;
        request.retry_count += 1;
        if request.retry_count >= max_retries {
            self.store.delete(REQUESTS, id)?;
            tracing::warn!(id, url = %request.url, "dropping request after retry exhaustion");
            return Ok(true);
        }
        self.store.put(REQUESTS, id, &serde_json::to_value(&request)?)?;
        Ok(false)
    }

    /// Cache a value for offline reads
    pub fn cache_data(&self, key: &str, data: Value, ttl: Duration) -> Result<()> {
        let stored_at = now_millis();
        let entry = OfflineCacheEntry {
            data,
            stored_at,
            expires_at: stored_at + (ttl.as_millis() as u64).max(1),
        };
        self.store.put(DATA, key, &serde_json::to_value(&entry)?)?;
        Ok(())
    }

    /// Read a value cached for offline use; expired entries are removed
    pub fn get_cached_data(&self, key: &str) -> Result<Option<Value>> {
        let Some(raw) = self.store.get(DATA, key)? else {
            return Ok(None);
        };
        let entry: OfflineCacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key, %err, "deleting malformed offline cache entry");
                self.store.delete(DATA, key)?;
                return Ok(None);
            }
        };
        if now_millis() > entry.expires_at {
            self.store.delete(DATA, key)?;
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    /// Queue and cache counters
    pub fn stats(&self) -> Result<OfflineStats> {
        Ok(OfflineStats {
            pending_actions: self
                .store
                .get_all_by_index(ACTIONS, "status", &json!("pending"))?
                .len(),
            queued_requests: self.store.count(REQUESTS)?,
            cached_items: self.store.count(DATA)?,
            failed_actions: self
                .store
                .get_all_by_index(ACTIONS, "status", &json!("failed"))?
                .len(),
        })
    }

    /// Wipe all three collections. Irreversible.
    pub fn clear_all(&self) -> Result<()> {
        self.store.clear(ACTIONS)?;
        self.store.clear(REQUESTS)?;
        self.store.clear(DATA)?;
        tracing::info!("cleared offline actions, queued requests, and cached data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage::SledStore;

    fn offline() -> OfflineStore {
        OfflineStore::new(Arc::new(SledStore::in_memory().unwrap()))
    }

    #[test]
    fn test_enqueue_action_starts_pending() {
        let store = offline();

        let id = store
            .enqueue_action(ActionKind::Create, "tasks", json!({"title": "x"}))
            .unwrap();

        let action = store.get_action(&id).unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.entity, "tasks");
    }

    #[test]
    fn test_pending_actions_oldest_first() {
        let store = offline();

        let first = store
            .enqueue_action(ActionKind::Create, "tasks", json!({"n": 1}))
            .unwrap();
        let second = store
            .enqueue_action(ActionKind::Create, "tasks", json!({"n": 2}))
            .unwrap();

        let pending = store.pending_actions().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
    }

    #[test]
    fn test_terminal_actions_leave_pending_set() {
        let store = offline();

        let synced = store
            .enqueue_action(ActionKind::Create, "tasks", json!({}))
            .unwrap();
        let failed = store
            .enqueue_action(ActionKind::Create, "tasks", json!({}))
            .unwrap();
        store
            .enqueue_action(ActionKind::Create, "tasks", json!({}))
            .unwrap();

        store.mark_synced(&synced).unwrap();
        store.mark_failed(&failed).unwrap();

        assert_eq!(store.pending_actions().unwrap().len(), 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending_actions, 1);
        assert_eq!(stats.failed_actions, 1);
    }

    #[test]
    fn test_action_fails_after_max_retries() {
        let store = offline();
        let id = store
            .enqueue_action(ActionKind::Create, "tasks", json!({}))
            .unwrap();

        assert_eq!(store.record_action_failure(&id, 3).unwrap(), ActionStatus::Pending);
        assert_eq!(store.record_action_failure(&id, 3).unwrap(), ActionStatus::Pending);
        assert_eq!(store.record_action_failure(&id, 3).unwrap(), ActionStatus::Failed);

        let action = store.get_action(&id).unwrap().unwrap();
        assert_eq!(action.retry_count, 3);
        assert!(store.pending_actions().unwrap().is_empty());
    }

    #[test]
    fn test_request_dropped_after_max_retries() {
        let store = offline();
        let id = store
            .enqueue_request(&Request::post("https://api.test/tasks").body(json!({})))
            .unwrap();

        assert!(!store.record_request_failure(&id, 3).unwrap());
        assert!(!store.record_request_failure(&id, 3).unwrap());
        assert!(store.record_request_failure(&id, 3).unwrap());

        assert_eq!(store.stats().unwrap().queued_requests, 0);
    }

    #[test]
    fn test_remove_request_decrements_stats() {
        let store = offline();
        let id = store
            .enqueue_request(&Request::post("https://api.test/tasks"))
            .unwrap();
        assert_eq!(store.stats().unwrap().queued_requests, 1);

        store.remove_request(&id).unwrap();
        assert_eq!(store.stats().unwrap().queued_requests, 0);
    }

    #[test]
    fn test_queued_request_roundtrip() {
        let store = offline();
        let original = Request::put("https://api.test/tasks/t1")
            .header("Authorization", "Bearer tok")
            .body(json!({"done": true}));

        store.enqueue_request(&original).unwrap();

        let queued = store.queued_requests().unwrap();
        let replay = queued[0].to_request();
        assert_eq!(replay.method, Method::Put);
        assert_eq!(replay.url, "https://api.test/tasks/t1");
        assert_eq!(replay.headers.get("Authorization").map(String::as_str), Some("Bearer tok"));
        assert_eq!(replay.body, Some(json!({"done": true})));
    }

    #[test]
    fn test_offline_data_cache_ttl() {
        let store = offline();

        store
            .cache_data("feed", json!([1, 2, 3]), Duration::from_millis(40))
            .unwrap();
        assert_eq!(store.get_cached_data("feed").unwrap(), Some(json!([1, 2, 3])));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.get_cached_data("feed").unwrap(), None);
        assert_eq!(store.stats().unwrap().cached_items, 0);
    }

    #[test]
    fn test_clear_all_zeroes_stats() {
        let store = offline();

        store
            .enqueue_action(ActionKind::Delete, "tasks", json!({"id": "t1"}))
            .unwrap();
        store
            .enqueue_request(&Request::post("https://api.test/tasks"))
            .unwrap();
        store
            .cache_data("feed", json!([]), Duration::from_secs(60))
            .unwrap();

        store.clear_all().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats, OfflineStats::default());
    }

    #[test]
    fn test_request_for_action_mapping() {
        let create =
            request_for_action("https://api.test/", ActionKind::Create, "tasks", &json!({"title": "x"}))
                .unwrap();
        assert_eq!(create.method, Method::Post);
        assert_eq!(create.url, "https://api.test/tasks");
        assert_eq!(create.body, Some(json!({"title": "x"})));

        let update = request_for_action(
            "https://api.test",
            ActionKind::Update,
            "tasks",
            &json!({"id": "t1", "title": "y"}),
        )
        .unwrap();
        assert_eq!(update.method, Method::Put);
        assert_eq!(update.url, "https://api.test/tasks/t1");

        let delete =
            request_for_action("https://api.test", ActionKind::Delete, "tasks", &json!({"id": "t1"}))
                .unwrap();
        assert_eq!(delete.method, Method::Delete);
        assert_eq!(delete.url, "https://api.test/tasks/t1");
        assert_eq!(delete.body, None);
    }

    #[test]
    fn test_request_for_action_requires_id() {
        assert!(request_for_action("https://api.test", ActionKind::Update, "tasks", &json!({}))
            .is_none());
        assert!(request_for_action("https://api.test", ActionKind::Delete, "tasks", &json!({}))
            .is_none());
    }
}
