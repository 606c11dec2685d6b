//! In-memory implementation of KeyValueStore for testing

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::store::*;

/// Internal entry state
struct Entry {
    /// Insertion sequence, kept when the value is overwritten
    seq: u64,
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl Inner {
    fn upsert(&mut self, key: &str, value: serde_json::Value, expires_at: Option<Instant>) {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(key).filter(|e| e.is_live(now)) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                seq,
                value,
                expires_at,
            },
        );
    }

    fn live_keys(&self, prefix: &str) -> Vec<(u64, &str)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, e)| (e.seq, k.as_str()))
            .collect()
    }
}

/// In-memory implementation of KeyValueStore
///
/// This is primarily for testing and single-host embedding. It provides the
/// same semantics as the PostgreSQL implementation, including TTL expiry and
/// insertion-ordered prefix scans.
///
/// # Example
///
/// ```
/// use batchrun_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Get the number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let inner = self.inner.read();
        let now = Instant::now();
        Ok(inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.inner.write().upsert(key, value, None);
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .upsert(key, value, Some(Instant::now() + ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // Check and write under one write guard
        let mut inner = self.inner.write();
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        inner.upsert(key, value, Some(now + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read();
        let mut keys = inner.live_keys(prefix);
        keys.sort_by_key(|(seq, _)| *seq);
        Ok(keys.into_iter().map(|(_, k)| k.to_string()).collect())
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        Ok(self.inner.read().live_keys(prefix).len())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let mut removed = 0;
        inner.entries.retain(|k, e| {
            if k.starts_with(prefix) {
                if e.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();

        store.set("a", json!({"k": 1})).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(json!({"k": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_keeps_insertion_order() {
        let store = InMemoryStore::new();

        store.set("p_batch_z", json!(1)).await.unwrap();
        store.set("p_batch_a", json!(2)).await.unwrap();
        store.set("p_batch_m", json!(3)).await.unwrap();
        store.set("other", json!(4)).await.unwrap();

        // Overwrite must not move the key to the tail
        store.set("p_batch_z", json!(5)).await.unwrap();

        let keys = store.scan_prefix("p_batch_").await.unwrap();
        assert_eq!(keys, vec!["p_batch_z", "p_batch_a", "p_batch_m"]);
        assert_eq!(store.count_prefix("p_batch_").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = InMemoryStore::new();

        store.set("p_batch_1", json!(1)).await.unwrap();
        store.set("p_batch_2", json!(2)).await.unwrap();
        store.set("p_tasks_count", json!(2)).await.unwrap();

        assert_eq!(store.delete_prefix("p_batch_").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("p_batch_").await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_if_absent("lock", json!("a"), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", json!("b"), ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(json!("a")));

        store.delete("lock").await.unwrap();
        assert!(store.set_if_absent("lock", json!("c"), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let store = InMemoryStore::new();

        store
            .set_with_ttl("lock", json!(true), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.exists("lock").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.exists("lock").await.unwrap());
        assert_eq!(store.count_prefix("lock").await.unwrap(), 0);
        assert!(store
            .set_if_absent("lock", json!(1), Duration::from_secs(1))
            .await
            .unwrap());
    }
}
