//! KeyValueStore trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Durable key-value store holding every piece of queue state
///
/// Values are JSON documents. Keys written with a TTL disappear once the TTL
/// elapses: an expired key is invisible to `get`, the prefix operations and
/// `set_if_absent`.
///
/// Implementations must be thread-safe and support concurrent access from
/// several process instances. Only read-your-writes consistency within one
/// caller is assumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value, `None` when the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Write a value without expiry
    ///
    /// Overwriting an existing key keeps its insertion position.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Write a value that expires after `ttl`
    async fn set_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Atomically write `value` with expiry `ttl` only if the key is absent
    /// or expired
    ///
    /// Returns whether this call wrote the key. Two racing callers must never
    /// both observe `true`.
    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All live keys starting with `prefix`, in insertion order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Number of live keys starting with `prefix`
    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Delete every key starting with `prefix`, returning how many went away
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Whether a live value exists under `key`
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}
