//! Time-boxed run lock
//!
//! At most one run per process name. The lock is a single TTL key: taking it
//! is one compare-and-set in the store, and a crashed run's lock simply
//! expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument};

use crate::keys::ProcessKeys;
use crate::persistence::{KeyValueStore, StoreError};

/// Single-run lock of one process
#[derive(Clone)]
pub struct RunLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl RunLock {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: &ProcessKeys) -> Self {
        Self {
            store,
            key: keys.lock(),
        }
    }

    /// Try to take the lock; returns whether this call won it
    ///
    /// Never blocks: a held lock is a plain `false`.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn acquire(&self, ttl: Duration) -> Result<bool, StoreError> {
        let won = self
            .store
            .set_if_absent(&self.key, lock_value(), ttl)
            .await?;

        if won {
            debug!("lock acquired");
        } else {
            debug!("lock held elsewhere");
        }
        Ok(won)
    }

    /// Push the expiry out by `ttl`
    pub async fn refresh(&self, ttl: Duration) -> Result<(), StoreError> {
        self.store.set_with_ttl(&self.key, lock_value(), ttl).await
    }

    /// Drop the lock; releasing a free lock is fine
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn release(&self) -> Result<(), StoreError> {
        self.store.delete(&self.key).await?;
        debug!("lock released");
        Ok(())
    }

    pub async fn is_held(&self) -> Result<bool, StoreError> {
        self.store.exists(&self.key).await
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("key", &self.key).finish()
    }
}

fn lock_value() -> serde_json::Value {
    json!({ "locked_at": Utc::now().to_rfc3339() })
}
