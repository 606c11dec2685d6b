//! Persisted batches of pending tasks
//!
//! A batch is one durable record holding an ordered list of tasks. The queue
//! of a process is every batch key under its prefix, in insertion order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::keys::ProcessKeys;
use crate::persistence::{KeyValueStore, StoreError};

/// Generate a unique batch key for the process
///
/// UUID v7 keeps keys unique across concurrent enqueues and roughly
/// time-ordered; the store's insertion order stays authoritative.
pub fn generate_batch_key(keys: &ProcessKeys) -> String {
    format!("{}{}", keys.batch_prefix(), Uuid::now_v7().simple())
}

/// An ordered set of batches with an explicit cursor
///
/// Discovery is cheap: only batch keys are read up front and each batch's
/// tasks are loaded on first access. The cursor addresses the current batch;
/// removing a batch fixes the cursor up so a traversal driven by
/// [`BatchSet::current`] and [`BatchSet::advance`] sees no gaps and no
/// repeats.
///
/// # Example
///
/// ```ignore
/// let mut batches = BatchSet::load_pending(store, keys).await?;
///
/// while let Some((batch, tasks)) = batches.current().await? {
///     // ... work through tasks
///     batches.remove_batch(&batch).await?;
///     batches.advance();
/// }
/// ```
pub struct BatchSet {
    store: Arc<dyn KeyValueStore>,
    keys: ProcessKeys,
    /// Batch keys in discovery order
    names: Vec<String>,
    /// Tasks of batches loaded so far
    loaded: HashMap<String, Vec<Value>>,
    cursor: usize,
    /// The current batch was removed, so the cursor already sits on its
    /// successor and the next `advance` must not move it
    skip_advance: bool,
}

impl BatchSet {
    fn new(
        store: Arc<dyn KeyValueStore>,
        keys: ProcessKeys,
        names: Vec<String>,
        loaded: HashMap<String, Vec<Value>>,
    ) -> Self {
        Self {
            store,
            keys,
            names,
            loaded,
            cursor: 0,
            skip_advance: false,
        }
    }

    /// Split `tasks` into chunks of at most `batch_size` and persist each as
    /// a new batch
    #[instrument(skip(store, tasks), fields(process = %keys.name(), tasks = tasks.len()))]
    pub async fn enqueue(
        store: Arc<dyn KeyValueStore>,
        keys: ProcessKeys,
        tasks: Vec<Value>,
        batch_size: usize,
    ) -> Result<Self, StoreError> {
        let batch_size = batch_size.max(1);
        let mut names = Vec::with_capacity(tasks.len().div_ceil(batch_size));
        let mut loaded = HashMap::with_capacity(names.capacity());

        for chunk in tasks.chunks(batch_size) {
            let name = generate_batch_key(&keys);
            let chunk = chunk.to_vec();

            store.set(&name, Value::Array(chunk.clone())).await?;
            trace!(batch = %name, size = chunk.len(), "saved batch");

            names.push(name.clone());
            loaded.insert(name, chunk);
        }

        debug!(batches = names.len(), "enqueued batches");
        Ok(Self::new(store, keys, names, loaded))
    }

    /// Discover every pending batch of the process without loading tasks
    #[instrument(skip(store), fields(process = %keys.name()))]
    pub async fn load_pending(
        store: Arc<dyn KeyValueStore>,
        keys: ProcessKeys,
    ) -> Result<Self, StoreError> {
        let names = store.scan_prefix(&keys.batch_prefix()).await?;
        debug!(batches = names.len(), "discovered pending batches");
        Ok(Self::new(store, keys, names, HashMap::new()))
    }

    /// Whether at least one batch exists for the process
    pub async fn has_more(store: &dyn KeyValueStore, keys: &ProcessKeys) -> Result<bool, StoreError> {
        Ok(store.count_prefix(&keys.batch_prefix()).await? > 0)
    }

    /// Number of batches currently persisted for the process
    pub async fn pending_count(
        store: &dyn KeyValueStore,
        keys: &ProcessKeys,
    ) -> Result<usize, StoreError> {
        store.count_prefix(&keys.batch_prefix()).await
    }

    /// Delete every batch of the process; safe when none exist
    #[instrument(skip(store), fields(process = %keys.name()))]
    pub async fn remove_all(store: &dyn KeyValueStore, keys: &ProcessKeys) -> Result<usize, StoreError> {
        let removed = store.delete_prefix(&keys.batch_prefix()).await?;
        debug!(removed, "removed all batches");
        Ok(removed)
    }

    /// Number of batches in this set
    pub fn count(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Batch keys in iteration order
    pub fn ids(&self) -> &[String] {
        &self.names
    }

    /// Key of the batch under the cursor
    pub fn current_id(&self) -> Option<&str> {
        self.names.get(self.cursor).map(String::as_str)
    }

    /// The batch under the cursor with its tasks, loading them on first access
    ///
    /// A batch whose record vanished (e.g. removed by a cancellation) loads
    /// as empty.
    pub async fn current(&mut self) -> Result<Option<(String, Vec<Value>)>, StoreError> {
        let Some(name) = self.names.get(self.cursor).cloned() else {
            return Ok(None);
        };

        if let Some(tasks) = self.loaded.get(&name) {
            return Ok(Some((name, tasks.clone())));
        }

        let tasks = match self.store.get(&name).await? {
            Some(Value::Array(tasks)) => tasks,
            Some(other) => {
                return Err(StoreError::Serialization(format!(
                    "batch {name} is not a task list: {other}"
                )))
            }
            None => Vec::new(),
        };

        trace!(batch = %name, size = tasks.len(), "loaded batch");
        self.loaded.insert(name.clone(), tasks.clone());
        Ok(Some((name, tasks)))
    }

    /// Move the cursor to the next batch
    pub fn advance(&mut self) {
        if self.skip_advance {
            self.skip_advance = false;
        } else if self.cursor < self.names.len() {
            self.cursor += 1;
        }
    }

    /// Delete a batch from the store and from this set
    ///
    /// Returns whether the batch was part of the set.
    pub async fn remove_batch(&mut self, name: &str) -> Result<bool, StoreError> {
        let Some(index) = self.names.iter().position(|n| n == name) else {
            return Ok(false);
        };

        self.store.delete(name).await?;
        self.names.remove(index);
        self.loaded.remove(name);

        if index < self.cursor {
            self.cursor -= 1;
        } else if index == self.cursor {
            self.skip_advance = true;
        }

        debug!(process = %self.keys.name(), batch = %name, "removed batch");
        Ok(true)
    }

    /// Overwrite the batch under the cursor with `tasks`
    ///
    /// The batch keeps its position in the queue.
    pub async fn save_current(&mut self, tasks: Vec<Value>) -> Result<(), StoreError> {
        let Some(name) = self.names.get(self.cursor).cloned() else {
            return Ok(());
        };

        self.store.set(&name, Value::Array(tasks.clone())).await?;
        trace!(batch = %name, size = tasks.len(), "saved current batch");
        self.loaded.insert(name, tasks);
        Ok(())
    }
}

impl std::fmt::Debug for BatchSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSet")
            .field("process", &self.keys.name())
            .field("batches", &self.names.len())
            .field("loaded", &self.loaded.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn tasks(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!(i)).collect()
    }

    fn setup() -> (Arc<dyn KeyValueStore>, ProcessKeys) {
        (Arc::new(InMemoryStore::new()), ProcessKeys::new("test_process"))
    }

    #[tokio::test]
    async fn test_enqueue_chunks_tasks() {
        let (store, keys) = setup();

        let batches = BatchSet::enqueue(store.clone(), keys.clone(), tasks(250), 100)
            .await
            .unwrap();

        assert_eq!(batches.count(), 3);
        assert_eq!(BatchSet::pending_count(&*store, &keys).await.unwrap(), 3);

        let sizes: Vec<usize> = {
            let mut sizes = vec![];
            for id in batches.ids() {
                let value = store.get(id).await.unwrap().unwrap();
                sizes.push(value.as_array().unwrap().len());
            }
            sizes
        };
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn test_enqueue_empty_creates_nothing() {
        let (store, keys) = setup();

        let batches = BatchSet::enqueue(store.clone(), keys.clone(), vec![], 10)
            .await
            .unwrap();

        assert!(batches.is_empty());
        assert!(!BatchSet::has_more(&*store, &keys).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_pending_is_lazy_and_ordered() {
        let (store, keys) = setup();
        let first = BatchSet::enqueue(store.clone(), keys.clone(), tasks(3), 2)
            .await
            .unwrap();
        let second = BatchSet::enqueue(store.clone(), keys.clone(), tasks(1), 2)
            .await
            .unwrap();

        let mut pending = BatchSet::load_pending(store.clone(), keys.clone())
            .await
            .unwrap();

        let mut expected: Vec<String> = first.ids().to_vec();
        expected.extend(second.ids().iter().cloned());
        assert_eq!(pending.ids(), expected.as_slice());
        assert_eq!(pending.loaded.len(), 0);

        let (id, loaded) = pending.current().await.unwrap().unwrap();
        assert_eq!(id, expected[0]);
        assert_eq!(loaded, vec![json!(0), json!(1)]);
        assert_eq!(pending.loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_current_keeps_traversal_gapless() {
        let (store, keys) = setup();
        BatchSet::enqueue(store.clone(), keys.clone(), tasks(4), 1)
            .await
            .unwrap();
        let mut batches = BatchSet::load_pending(store.clone(), keys.clone())
            .await
            .unwrap();
        let all = batches.ids().to_vec();

        let mut visited = vec![];
        while let Some((id, _)) = batches.current().await.unwrap() {
            visited.push(id.clone());
            // Remove every other batch while iterating
            if visited.len() % 2 == 1 {
                batches.remove_batch(&id).await.unwrap();
            }
            batches.advance();
        }

        assert_eq!(visited, all);
        assert_eq!(batches.count(), 2);
        assert_eq!(BatchSet::pending_count(&*store, &keys).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_earlier_batch_fixes_cursor() {
        let (store, keys) = setup();
        let mut batches = BatchSet::enqueue(store.clone(), keys.clone(), tasks(3), 1)
            .await
            .unwrap();
        let all = batches.ids().to_vec();

        batches.advance();
        assert_eq!(batches.current_id(), Some(all[1].as_str()));

        batches.remove_batch(&all[0]).await.unwrap();
        assert_eq!(batches.current_id(), Some(all[1].as_str()));

        batches.advance();
        assert_eq!(batches.current_id(), Some(all[2].as_str()));
    }

    #[tokio::test]
    async fn test_save_current_overwrites_in_place() {
        let (store, keys) = setup();
        let mut batches = BatchSet::enqueue(store.clone(), keys.clone(), tasks(4), 2)
            .await
            .unwrap();
        let all = batches.ids().to_vec();

        batches.save_current(vec![json!("x")]).await.unwrap();

        assert_eq!(store.get(&all[0]).await.unwrap(), Some(json!(["x"])));
        let scanned = store.scan_prefix(&keys.batch_prefix()).await.unwrap();
        assert_eq!(scanned, all);
    }

    #[tokio::test]
    async fn test_remove_all_is_safe_when_empty() {
        let (store, keys) = setup();

        assert_eq!(BatchSet::remove_all(&*store, &keys).await.unwrap(), 0);

        BatchSet::enqueue(store.clone(), keys.clone(), tasks(5), 2)
            .await
            .unwrap();
        assert_eq!(BatchSet::remove_all(&*store, &keys).await.unwrap(), 3);
        assert!(!BatchSet::has_more(&*store, &keys).await.unwrap());
    }
}
