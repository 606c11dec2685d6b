//! Durable progress counters
//!
//! Four counters per process: tasks and batches, total and completed. Reads
//! go through an in-memory cache that is only trusted within one instance;
//! callers that race with growth of the queue ask for a fresh read.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::keys::ProcessKeys;
use crate::persistence::{KeyValueStore, StoreError};

/// One of the durable counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    TasksCount,
    TasksCompleted,
    BatchesCount,
    BatchesCompleted,
}

impl Stat {
    pub const ALL: [Stat; 4] = [
        Stat::TasksCount,
        Stat::TasksCompleted,
        Stat::BatchesCount,
        Stat::BatchesCompleted,
    ];

    /// Key suffix under the process name
    pub fn suffix(&self) -> &'static str {
        match self {
            Stat::TasksCount => "tasks_count",
            Stat::TasksCompleted => "tasks_completed",
            Stat::BatchesCount => "batches_count",
            Stat::BatchesCompleted => "batches_completed",
        }
    }
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Reads and increments the counters of one process
pub struct StatsTracker {
    store: Arc<dyn KeyValueStore>,
    keys: ProcessKeys,
    cache: Mutex<HashMap<Stat, u64>>,
}

impl StatsTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: ProcessKeys) -> Self {
        Self {
            store,
            keys,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Current value, served from the cache when possible
    pub async fn get(&self, stat: Stat) -> Result<u64, StoreError> {
        if let Some(value) = self.cache.lock().get(&stat).copied() {
            return Ok(value);
        }
        self.get_fresh(stat).await
    }

    /// Current value read from the store, refreshing the cache
    pub async fn get_fresh(&self, stat: Stat) -> Result<u64, StoreError> {
        let value = self
            .store
            .get(&self.keys.stat(stat.suffix()))
            .await?
            .map(|v| parse_counter(stat, &v))
            .transpose()?
            .unwrap_or(0);

        self.cache.lock().insert(stat, value);
        Ok(value)
    }

    /// Add `by` to the counter and persist it
    ///
    /// With `fresh` the current value is re-read from the store instead of
    /// the cache.
    pub async fn increase(&self, stat: Stat, by: u64, fresh: bool) -> Result<u64, StoreError> {
        let current = if fresh {
            self.get_fresh(stat).await?
        } else {
            self.get(stat).await?
        };
        let value = current.saturating_add(by);

        self.store
            .set(&self.keys.stat(stat.suffix()), Value::from(value))
            .await?;
        self.cache.lock().insert(stat, value);

        trace!(process = %self.keys.name(), %stat, value, "increased counter");
        Ok(value)
    }

    /// Forget every cached value
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

impl std::fmt::Debug for StatsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsTracker")
            .field("process", &self.keys.name())
            .field("cache", &*self.cache.lock())
            .finish()
    }
}

fn parse_counter(stat: Stat, value: &Value) -> Result<u64, StoreError> {
    value
        .as_u64()
        .ok_or_else(|| StoreError::Serialization(format!("counter {stat} is not a number: {value}")))
}

/// Completion percentage in `[0, 100]`, rounded to `decimals` places
///
/// An empty queue counts as done.
pub fn progress(completed: u64, total: u64, decimals: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }

    let scale = 10f64.powi(decimals as i32);
    let percent = completed as f64 / total as f64 * 100.0;
    ((percent * scale).round() / scale).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    fn tracker() -> (Arc<dyn KeyValueStore>, StatsTracker) {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let tracker = StatsTracker::new(store.clone(), ProcessKeys::new("p"));
        (store, tracker)
    }

    #[tokio::test]
    async fn test_missing_counter_reads_zero() {
        let (_, stats) = tracker();
        assert_eq!(stats.get(Stat::TasksCount).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increase_persists() {
        let (store, stats) = tracker();

        stats.increase(Stat::TasksCount, 5, false).await.unwrap();
        stats.increase(Stat::TasksCount, 2, false).await.unwrap();

        assert_eq!(stats.get(Stat::TasksCount).await.unwrap(), 7);
        assert_eq!(store.get("p_tasks_count").await.unwrap(), Some(Value::from(7)));
    }

    #[tokio::test]
    async fn test_fresh_increase_sees_outside_writes() {
        let (store, stats) = tracker();
        stats.increase(Stat::TasksCount, 10, false).await.unwrap();

        // Another instance grew the queue behind the cache
        store.set("p_tasks_count", Value::from(15)).await.unwrap();

        assert_eq!(stats.get(Stat::TasksCount).await.unwrap(), 10);
        assert_eq!(stats.increase(Stat::TasksCount, 1, true).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_non_numeric_counter_is_an_error() {
        let (store, stats) = tracker();
        store.set("p_tasks_completed", Value::from("x")).await.unwrap();

        let err = stats.get(Stat::TasksCompleted).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_progress_bounds() {
        assert_eq!(progress(0, 0, 0), 100.0);
        assert_eq!(progress(0, 10, 0), 0.0);
        assert_eq!(progress(1, 3, 2), 33.33);
        assert_eq!(progress(2, 3, 1), 66.7);
        assert_eq!(progress(10, 10, 0), 100.0);
        assert_eq!(progress(11, 10, 0), 100.0);
    }

    #[test]
    fn test_progress_never_rounds_past_hundred() {
        assert_eq!(progress(99_999, 100_000, 0), 100.0);
        assert!(progress(99_999, 100_000, 3) <= 100.0);
    }
}
