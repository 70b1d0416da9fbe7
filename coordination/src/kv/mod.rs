//! Key-value store adapter for chatroom state.
//!
//! Everything the chatroom persists (message log, room state, generation
//! lock, persuasion book, snapshots, trades) goes through the [`KvStore`]
//! trait as JSON strings. Two backends exist:
//!
//! - [`MemoryKv`]: in-process map with lazy TTL expiry (default)
//! - `RocksKv`: RocksDB column family with JSON envelopes (`heavy-state`)
//!
//! The lock primitive is `set_nx` with a TTL, the same contract as
//! `SET key value NX EX ttl`.

pub mod memory;
#[cfg(feature = "heavy-state")]
pub mod rocks;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

pub use memory::MemoryKv;
#[cfg(feature = "heavy-state")]
pub use rocks::RocksKv;

/// Error type for KV operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error for key {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for KV operations
pub type KvResult<T> = Result<T, KvError>;

/// Shared handle to a KV backend
pub type SharedKv = Arc<dyn KvStore>;

/// Minimal string KV surface used by the chatroom.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Write a value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;

    /// Remove a key. Returns whether it existed.
    async fn del(&self, key: &str) -> KvResult<bool>;

    /// Atomically increment an integer counter, creating it at 0.
    async fn incr(&self, key: &str) -> KvResult<i64>;

    /// Set or replace the TTL of an existing key. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;
}

/// Typed JSON helpers on top of any [`KvStore`].
#[async_trait]
pub trait KvExt: KvStore {
    async fn get_json<T>(&self, key: &str) -> KvResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| KvError::Deserialization {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> KvResult<()>
    where
        T: Serialize + Sync,
    {
        let raw =
            serde_json::to_string(value).map_err(|e| KvError::Serialization(e.to_string()))?;
        self.set(key, &raw, ttl).await
    }
}

impl<S: KvStore + ?Sized> KvExt for S {}

/// Parse a stored counter value.
pub(crate) fn parse_counter(key: &str, raw: Option<&str>) -> KvResult<i64> {
    match raw {
        None => Ok(0),
        Some(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| KvError::NotAnInteger(key.to_string())),
    }
}
