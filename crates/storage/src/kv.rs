//! Durable key-value store
//!
//! This module provides the [`DurableStore`] capability the rest of the
//! engine persists through: a key-value store organized into named
//! collections, with a secondary lookup by JSON field. [`SledStore`] is
//! the production backend; its `in_memory` mode backs tests.

use parking_lot::Mutex;
use serde_json::Value;
use sled::{Db, Tree};
use std::collections::HashMap;
use thiserror::Error;

/// Storage error types
#[derive(Debug, Error)]
pub enum KvError {
    /// Sled database error
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Flush interval in milliseconds (None for immediate flush)
    pub flush_every_ms: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "tidepool.db".to_string(),
            cache_capacity: 64 * 1024 * 1024, // 64MB
            use_compression: true,
            flush_every_ms: Some(500),
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Capability interface over the durable backend.
///
/// Each engine component owns a disjoint set of collections, so no two
/// components ever contend on the same keys. Implementations must survive
/// process restarts (in-memory test instances excepted). This is the only
/// hard external dependency of the engine; any key-value backend with a
/// field lookup can satisfy it.
pub trait DurableStore: Send + Sync {
    /// Write a JSON value under `key`.
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()>;

    /// Read the value under `key`.
    ///
    /// A corrupt entry is deleted and reads as absent rather than
    /// surfacing a parse error.
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    /// Delete the value under `key`, reporting whether it existed.
    fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// All live entries of a collection, in unspecified order.
    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>>;

    /// Entries whose top-level `field` equals `expected`.
    fn get_all_by_index(
        &self,
        collection: &str,
        field: &str,
        expected: &Value,
    ) -> Result<Vec<(String, Value)>>;

    /// Number of entries in a collection.
    fn count(&self, collection: &str) -> Result<usize>;

    /// Remove every entry of a collection.
    fn clear(&self, collection: &str) -> Result<()>;

    /// Flush pending writes to disk.
    fn flush(&self) -> Result<()>;
}

/// Sled-backed durable store, one tree per collection
pub struct SledStore {
    db: Db,
    trees: Mutex<HashMap<String, Tree>>,
}

impl SledStore {
    /// Open (or create) a store at the configured path
    pub fn new(config: KvConfig) -> Result<Self> {
        let mut db_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression);

        if let Some(ms) = config.flush_every_ms {
            db_config = db_config.flush_every_ms(Some(ms));
        }

        let db = db_config.open()?;

        Ok(Self { db, trees: Mutex::new(HashMap::new()) })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;

        Ok(Self { db, trees: Mutex::new(HashMap::new()) })
    }

    fn tree(&self, collection: &str) -> Result<Tree> {
        let mut trees = self.trees.lock();
        if let Some(tree) = trees.get(collection) {
            return Ok(tree.clone());
        }
        let tree = self.db.open_tree(collection)?;
        trees.insert(collection.to_string(), tree.clone());
        Ok(tree)
    }
}

impl DurableStore for SledStore {
    fn put(&self, collection: &str, key: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree(collection)?.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let tree = self.tree(collection)?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    tracing::warn!(collection, key, %err, "deleting corrupt entry");
                    tree.remove(key.as_bytes())?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        Ok(self.tree(collection)?.remove(key.as_bytes())?.is_some())
    }

    fn get_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let tree = self.tree(collection)?;
        let mut entries = Vec::new();
        let mut corrupt = Vec::new();

        for item in tree.iter() {
            let (key, bytes) = item?;
            let Ok(key) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            match serde_json::from_slice(&bytes) {
                Ok(value) => entries.push((key, value)),
                Err(err) => {
                    tracing::warn!(collection, key = %key, %err, "deleting corrupt entry");
                    corrupt.push(key);
                }
            }
        }

        for key in corrupt {
            tree.remove(key.as_bytes())?;
        }

        Ok(entries)
    }

    fn get_all_by_index(
        &self,
        collection: &str,
        field: &str,
        expected: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let entries = self.get_all(collection)?;
        Ok(entries
            .into_iter()
            .filter(|(_, value)| value.get(field) == Some(expected))
            .collect())
    }

    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.tree(collection)?.len())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.tree(collection)?.clear()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let store = SledStore::in_memory().unwrap();

        store.put("items", "a", &json!({"name": "alpha"})).unwrap();

        let value = store.get("items", "a").unwrap();
        assert_eq!(value, Some(json!({"name": "alpha"})));
    }

    #[test]
    fn test_get_nonexistent() {
        let store = SledStore::in_memory().unwrap();
        assert_eq!(store.get("items", "missing").unwrap(), None);
    }

    #[test]
    fn test_delete() {
        let store = SledStore::in_memory().unwrap();

        store.put("items", "a", &json!(1)).unwrap();
        assert!(store.delete("items", "a").unwrap());
        assert!(!store.delete("items", "a").unwrap());
        assert_eq!(store.get("items", "a").unwrap(), None);
    }

    #[test]
    fn test_collections_are_disjoint() {
        let store = SledStore::in_memory().unwrap();

        store.put("left", "k", &json!("left")).unwrap();
        store.put("right", "k", &json!("right")).unwrap();

        assert_eq!(store.get("left", "k").unwrap(), Some(json!("left")));
        assert_eq!(store.get("right", "k").unwrap(), Some(json!("right")));

        store.clear("left").unwrap();
        assert_eq!(store.count("left").unwrap(), 0);
        assert_eq!(store.count("right").unwrap(), 1);
    }

    #[test]
    fn test_get_all_by_index() {
        let store = SledStore::in_memory().unwrap();

        store
            .put("jobs", "1", &json!({"status": "pending", "n": 1}))
            .unwrap();
        store
            .put("jobs", "2", &json!({"status": "done", "n": 2}))
            .unwrap();
        store
            .put("jobs", "3", &json!({"status": "pending", "n": 3}))
            .unwrap();

        let pending = store
            .get_all_by_index("jobs", "status", &json!("pending"))
            .unwrap();
        assert_eq!(pending.len(), 2);

        let done = store
            .get_all_by_index("jobs", "status", &json!("done"))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, "2");
    }

    #[test]
    fn test_corrupt_entry_reads_as_absent_and_is_removed() {
        let store = SledStore::in_memory().unwrap();

        store
            .tree("items")
            .unwrap()
            .insert("bad".as_bytes(), &b"not json"[..])
            .unwrap();

        assert_eq!(store.get("items", "bad").unwrap(), None);
        assert_eq!(store.count("items").unwrap(), 0);
    }

    #[test]
    fn test_corrupt_entry_skipped_by_get_all() {
        let store = SledStore::in_memory().unwrap();

        store.put("items", "good", &json!(1)).unwrap();
        store
            .tree("items")
            .unwrap()
            .insert("bad".as_bytes(), &b"{{{"[..])
            .unwrap();

        let entries = store.get_all("items").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "good");
        assert_eq!(store.count("items").unwrap(), 1);
    }

    #[test]
    fn test_config_builder() {
        let config = KvConfig::new("test.db")
            .cache_capacity(32 * 1024 * 1024)
            .use_compression(false)
            .flush_every_ms(Some(1000));

        assert_eq!(config.path, "test.db");
        assert_eq!(config.cache_capacity, 32 * 1024 * 1024);
        assert!(!config.use_compression);
        assert_eq!(config.flush_every_ms, Some(1000));
    }
}
