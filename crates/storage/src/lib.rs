//! Durable storage for the tidepool sync engine
//!
//! This crate provides the key-value capability the engine persists
//! through, plus the two-tier response cache built on top of it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod kv;

pub use cache::{CacheConfig, CacheEntry, CacheError, CacheOptions, CacheStats, CacheStore};
pub use kv::{DurableStore, KvConfig, KvError, SledStore};
