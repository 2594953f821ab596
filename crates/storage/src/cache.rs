//! Two-tier response cache
//!
//! Serves previously fetched response bodies keyed by a request
//! fingerprint. Every entry lives in a capped volatile tier; entries
//! written as persistent also land in the durable tier and survive
//! restarts. Entries carry a TTL and optional ETag/Last-Modified
//! validators for conditional revalidation.
//!
//! Independently namespaced instances may share one durable store: each
//! prefixes its durable keys, so `clear` and the expiry sweep never touch
//! another namespace's entries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::kv::{DurableStore, KvError};

/// Durable collection shared by every cache namespace.
const CACHE_COLLECTION: &str = "cached_data";

/// Cache error types
#[derive(Debug, Error)]
pub enum CacheError {
    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cached response body with its metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cached response body
    pub data: Value,
    /// When the entry was written (epoch milliseconds)
    pub stored_at: u64,
    /// When the entry stops being served (epoch milliseconds)
    pub expires_at: u64,
    /// ETag validator from the response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last-Modified validator from the response, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Write options for [`CacheStore::set`]
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Override the namespace default TTL
    pub ttl: Option<Duration>,
    /// Also write the durable tier
    pub persistent: bool,
    /// ETag validator to keep alongside the body
    pub etag: Option<String>,
    /// Last-Modified validator to keep alongside the body
    pub last_modified: Option<String>,
}

impl CacheOptions {
    /// Set an explicit TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Write the durable tier as well
    pub fn persist(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Attach an ETag validator
    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Attach a Last-Modified validator
    pub fn last_modified(mut self, last_modified: impl Into<String>) -> Self {
        self.last_modified = Some(last_modified.into());
        self
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key prefix isolating this instance's durable entries
    pub namespace: String,
    /// Volatile tier entry cap
    pub max_memory_entries: usize,
    /// TTL applied when a write does not specify one
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "api".to_string(),
            max_memory_entries: 100,
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    /// Configuration for a custom namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Default::default() }
    }

    /// Frequently-changing API responses (5 minutes)
    pub fn api() -> Self {
        Self::default()
    }

    /// User-profile data (1 hour)
    pub fn profile() -> Self {
        Self {
            namespace: "profile".to_string(),
            default_ttl: Duration::from_secs(60 * 60),
            ..Default::default()
        }
    }

    /// Static reference data (24 hours)
    pub fn reference() -> Self {
        Self {
            namespace: "reference".to_string(),
            default_ttl: Duration::from_secs(24 * 60 * 60),
            ..Default::default()
        }
    }

    /// Set the volatile tier entry cap
    pub fn max_memory_entries(mut self, max: usize) -> Self {
        self.max_memory_entries = max;
        self
    }

    /// Set the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Cache occupancy counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries in the volatile tier
    pub memory_entries: usize,
    /// Entries in this namespace's durable tier
    pub durable_entries: usize,
    /// Approximate durable footprint in bytes
    pub durable_bytes: u64,
}

/// Two-tier cache over a durable store
pub struct CacheStore {
    config: CacheConfig,
    memory: Mutex<HashMap<String, CacheEntry>>,
    durable: Arc<dyn DurableStore>,
}

impl CacheStore {
    /// Open a cache over `durable`.
    ///
    /// Expired durable entries under this namespace are swept once here;
    /// afterwards expiry is only enforced on read.
    pub fn new(config: CacheConfig, durable: Arc<dyn DurableStore>) -> Result<Self> {
        let store = Self { config, memory: Mutex::new(HashMap::new()), durable };
        store.sweep_expired()?;
        Ok(store)
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn namespace_prefix(&self) -> String {
        format!("{}:", self.config.namespace)
    }

    fn sweep_expired(&self) -> Result<()> {
        let now = now_millis();
        let prefix = self.namespace_prefix();
        let mut removed = 0usize;

        for (key, value) in self.durable.get_all(CACHE_COLLECTION)? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let expired = match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => entry.is_expired(now),
                Err(_) => true,
            };
            if expired {
                self.durable.delete(CACHE_COLLECTION, &key)?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(
                namespace = %self.config.namespace,
                removed,
                "swept expired cache entries"
            );
        }
        Ok(())
    }

    /// Store a value under `key`.
    ///
    /// Always writes the volatile tier; writes the durable tier iff the
    /// options ask for persistence. A failed durable write degrades to a
    /// volatile-only entry rather than failing the call.
    pub fn set(&self, key: &str, data: Value, opts: CacheOptions) -> Result<()> {
        let stored_at = now_millis();
        let ttl = opts.ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry {
            data,
            stored_at,
            // expires_at must exceed stored_at even for a zero TTL
            expires_at: stored_at + (ttl.as_millis() as u64).max(1),
            etag: opts.etag,
            last_modified: opts.last_modified,
        };

        if opts.persistent {
            let json = serde_json::to_value(&entry)?;
            if let Err(err) = self.durable.put(CACHE_COLLECTION, &self.durable_key(key), &json) {
                tracing::warn!(key, %err, "durable cache write failed, keeping volatile entry only");
            }
        }

        let mut memory = self.memory.lock();
        memory.insert(key.to_string(), entry);
        Self::evict_overflow(&mut memory, self.config.max_memory_entries);
        Ok(())
    }

    /// Look up a live entry, expiring it from both tiers if stale.
    fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = now_millis();

        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.get(key) {
                if !entry.is_expired(now) {
                    return Ok(Some(entry.clone()));
                }
                memory.remove(key);
                drop(memory);
                self.durable.delete(CACHE_COLLECTION, &self.durable_key(key))?;
                return Ok(None);
            }
        }

        let durable_key = self.durable_key(key);
        let Some(raw) = self.durable.get(CACHE_COLLECTION, &durable_key)? else {
            return Ok(None);
        };
        let entry: CacheEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(key, %err, "deleting malformed cache entry");
                self.durable.delete(CACHE_COLLECTION, &durable_key)?;
                return Ok(None);
            }
        };
        if entry.is_expired(now) {
            self.durable.delete(CACHE_COLLECTION, &durable_key)?;
            return Ok(None);
        }

        // Promote into the volatile tier.
        let mut memory = self.memory.lock();
        memory.insert(key.to_string(), entry.clone());
        Self::evict_overflow(&mut memory, self.config.max_memory_entries);
        Ok(Some(entry))
    }

    /// Get the cached value for `key`, or `None` if absent or expired
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entry(key)?.map(|entry| entry.data))
    }

    /// Whether a live value exists for `key`
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entry(key)?.is_some())
    }

    /// Remove `key` from both tiers
    pub fn delete(&self, key: &str) -> Result<()> {
        self.memory.lock().remove(key);
        self.durable.delete(CACHE_COLLECTION, &self.durable_key(key))?;
        Ok(())
    }

    /// Remove every entry under this namespace from both tiers
    pub fn clear(&self) -> Result<()> {
        self.memory.lock().clear();
        let prefix = self.namespace_prefix();
        for (key, _) in self.durable.get_all(CACHE_COLLECTION)? {
            if key.starts_with(&prefix) {
                self.durable.delete(CACHE_COLLECTION, &key)?;
            }
        }
        Ok(())
    }

    /// ETag validator for `key`, if the entry is still live.
    ///
    /// Available while the value itself is being revalidated, so callers
    /// can attach `If-None-Match` before issuing the call.
    pub fn get_etag(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entry(key)?.and_then(|entry| entry.etag))
    }

    /// Last-Modified validator for `key`, if the entry is still live
    pub fn get_last_modified(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entry(key)?.and_then(|entry| entry.last_modified))
    }

    /// Occupancy counters for this namespace
    pub fn stats(&self) -> Result<CacheStats> {
        let memory_entries = self.memory.lock().len();
        let prefix = self.namespace_prefix();
        let mut durable_entries = 0usize;
        let mut durable_bytes = 0u64;

        for (key, value) in self.durable.get_all(CACHE_COLLECTION)? {
            if !key.starts_with(&prefix) {
                continue;
            }
            durable_entries += 1;
            durable_bytes += key.len() as u64 + serde_json::to_vec(&value)?.len() as u64;
        }

        Ok(CacheStats { memory_entries, durable_entries, durable_bytes })
    }

    /// Evict the oldest-written entries beyond the cap.
    ///
    /// Ordered by `stored_at` (insertion recency, not access recency),
    /// ties broken by key so eviction is deterministic.
    fn evict_overflow(memory: &mut HashMap<String, CacheEntry>, cap: usize) {
        if memory.len() <= cap {
            return;
        }
        let mut by_age: Vec<(String, u64)> = memory
            .iter()
            .map(|(key, entry)| (key.clone(), entry.stored_at))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let excess = memory.len() - cap;
        for (key, _) in by_age.into_iter().take(excess) {
            memory.remove(&key);
        }
    }
}
