//! Process controller
//!
//! A [`BackgroundProcess`] owns one named queue. Tasks go in through
//! [`BackgroundProcess::add_tasks`], a wake-up starts a run through
//! [`BackgroundProcess::maybe_handle`], and runs keep re-triggering themselves
//! until the queue drains.
//!
//! ```text
//!  Idle --wake-up--> Locking --won--> Running --stop--> Draining --queue left--> (re-trigger) Idle
//!                       |                 |                 |
//!                       +--lost--> Idle   +--drained--> Completing <--queue empty--+
//! ```

mod events;
mod handler;
mod run;

pub use events::{CompositeEventListener, EventListener, NoopEventListener, ProcessEvent};
pub use handler::{handler_fn, FnHandler, TaskHandler, TaskOutcome};
pub use run::{RunOutcome, SkipReason};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::budget::{Clock, HostLimits, MemoryProbe, ProcessHostLimits, SysinfoMemoryProbe, SystemClock};
use crate::config::{ConfigError, ProcessConfig};
use crate::health::{HealthCheck, NoopHealthCheck};
use crate::keys::ProcessKeys;
use crate::lock::RunLock;
use crate::persistence::{KeyValueStore, StoreError};
use crate::queue::BatchSet;
use crate::stats::{progress, Stat, StatsTracker};
use crate::trigger::{NoopWakeTransport, TriggerError, WakeTransport};

/// Error from a process operation
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// A resumable background process
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Any number of
/// instances, in any number of OS processes, may point at the same store and
/// name: the run lock keeps at most one of them consuming the queue.
///
/// # Example
///
/// ```ignore
/// let process = BackgroundProcess::new(
///     ProcessConfig::new("import"),
///     store,
///     Arc::new(handler_fn(|workload| async move { TaskOutcome::Succeeded })),
/// )?
/// .with_transport(transport);
///
/// process.add_tasks(tasks).await?;
/// process.run().await?;
/// ```
pub struct BackgroundProcess {
    config: ProcessConfig,
    keys: ProcessKeys,
    store: Arc<dyn KeyValueStore>,
    handler: Arc<dyn TaskHandler>,
    transport: Arc<dyn WakeTransport>,
    health_check: Arc<dyn HealthCheck>,
    listener: Arc<dyn EventListener>,
    host: Arc<dyn HostLimits>,
    memory: Arc<dyn MemoryProbe>,
    clock: Arc<dyn Clock>,
    lock: RunLock,
    stats: StatsTracker,
    /// The run of this instance consuming the queue, if any
    current_run: Mutex<Option<CurrentRun>>,
    next_run_id: AtomicU64,
}

/// Marker of the run this instance is executing
#[derive(Debug, Clone, Copy)]
struct CurrentRun {
    id: u64,
    started_at: DateTime<Utc>,
}

impl BackgroundProcess {
    /// Validate `config` and build a process with default collaborators
    ///
    /// Defaults drop wake-ups and never run a health check; hosts plug in
    /// real ones with the `with_*` methods.
    pub fn new(
        config: ProcessConfig,
        store: Arc<dyn KeyValueStore>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let keys = ProcessKeys::new(config.name());
        let lock = RunLock::new(store.clone(), &keys);
        let stats = StatsTracker::new(store.clone(), keys.clone());

        Ok(Self {
            config,
            keys,
            store,
            handler,
            transport: Arc::new(NoopWakeTransport),
            health_check: Arc::new(NoopHealthCheck),
            listener: Arc::new(NoopEventListener),
            host: Arc::new(ProcessHostLimits::default()),
            memory: Arc::new(SysinfoMemoryProbe::new()),
            clock: Arc::new(SystemClock),
            lock,
            stats,
            current_run: Mutex::new(None),
            next_run_id: AtomicU64::new(0),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn WakeTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_health_check(mut self, health_check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_host_limits(mut self, host: Arc<dyn HostLimits>) -> Self {
        self.host = host;
        self
    }

    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The process name, `{prefix}_{action}`
    pub fn name(&self) -> &str {
        self.keys.name()
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn keys(&self) -> &ProcessKeys {
        &self.keys
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Persist `tasks` as new batches at the tail of the queue
    ///
    /// Safe to call while a run is consuming the queue. Does not start a run.
    #[instrument(skip(self, tasks), fields(process = %self.name(), tasks = tasks.len()))]
    pub async fn add_tasks(&self, tasks: Vec<Value>) -> Result<BatchSet, ProcessError> {
        let count = tasks.len() as u64;
        let batches = BatchSet::enqueue(
            self.store.clone(),
            self.keys.clone(),
            tasks,
            self.config.batch_size,
        )
        .await?;

        self.stats
            .increase(Stat::BatchesCount, batches.count() as u64, true)
            .await?;
        self.stats.increase(Stat::TasksCount, count, true).await?;

        info!(batches = batches.count(), "tasks added");
        Ok(batches)
    }

    /// Make sure the health check is scheduled and wake the process
    ///
    /// The wake-up is fire-and-forget; its failure is returned but the queue
    /// stays persisted for the health check to pick up.
    #[instrument(skip(self), fields(process = %self.name()))]
    pub async fn run(&self) -> Result<(), ProcessError> {
        self.health_check.schedule();
        self.transport.trigger(self.name()).await?;
        debug!("wake-up dispatched");
        Ok(())
    }

    /// Restart a stalled process
    ///
    /// Wakes the process when nothing runs and the queue is not empty. Called
    /// from inside a run of this instance (a handler or a listener) it does
    /// nothing unless `force` is set. Returns whether a wake-up was
    /// dispatched.
    pub async fn touch(&self, force: bool) -> Result<bool, ProcessError> {
        if !force && self.current_run.lock().is_some() {
            return Ok(false);
        }

        if !self.is_running().await? && !self.is_empty_queue().await? {
            info!(process = %self.name(), "process is down, restarting");
            self.run().await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Cancel the queue
    ///
    /// While a run is active this only raises the abort flag; the run wipes
    /// the queue at its next task boundary. Otherwise the queue and its
    /// counters are deleted right away.
    #[instrument(skip(self), fields(process = %self.name()))]
    pub async fn cancel(&self) -> Result<(), ProcessError> {
        if self.is_running().await? {
            self.store.set(&self.keys.abort(), Value::Bool(true)).await?;
            info!("abort requested");
        } else {
            self.health_check.unschedule();
            BatchSet::remove_all(&*self.store, &self.keys).await?;
            self.delete_options().await?;
            info!("queue cancelled");
        }
        Ok(())
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Whether some instance holds the run lock
    pub async fn is_running(&self) -> Result<bool, ProcessError> {
        Ok(self.lock.is_held().await?)
    }

    /// Whether no batch is left; reads the store, never a cache
    pub async fn is_empty_queue(&self) -> Result<bool, ProcessError> {
        Ok(!BatchSet::has_more(&*self.store, &self.keys).await?)
    }

    /// Running, or with work left for a future run
    pub async fn is_in_progress(&self) -> Result<bool, ProcessError> {
        Ok(self.is_running().await? || !self.is_empty_queue().await?)
    }

    /// Whether a cancellation is pending
    pub async fn is_aborting(&self) -> Result<bool, ProcessError> {
        Ok(self.read_abort_flag().await?)
    }

    pub fn is_health_check_scheduled(&self) -> bool {
        self.health_check.is_scheduled()
    }

    /// Start of the current run, or with `all_runs` of the first run of the
    /// queue cycle
    pub async fn start_time(&self, all_runs: bool) -> Result<Option<DateTime<Utc>>, ProcessError> {
        if !all_runs {
            return Ok(self.current_run.lock().as_ref().map(|run| run.started_at));
        }

        let started_at = self
            .store
            .get(&self.keys.started_at())
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(started_at)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn tasks_count(&self) -> Result<u64, ProcessError> {
        Ok(self.stats.get_fresh(Stat::TasksCount).await?)
    }

    pub async fn tasks_completed(&self) -> Result<u64, ProcessError> {
        Ok(self.stats.get_fresh(Stat::TasksCompleted).await?)
    }

    pub async fn tasks_left(&self) -> Result<u64, ProcessError> {
        Ok(self
            .tasks_count()
            .await?
            .saturating_sub(self.tasks_completed().await?))
    }

    pub async fn batches_count(&self) -> Result<u64, ProcessError> {
        Ok(self.stats.get_fresh(Stat::BatchesCount).await?)
    }

    pub async fn batches_completed(&self) -> Result<u64, ProcessError> {
        Ok(self.stats.get_fresh(Stat::BatchesCompleted).await?)
    }

    pub async fn batches_left(&self) -> Result<u64, ProcessError> {
        Ok(self
            .batches_count()
            .await?
            .saturating_sub(self.batches_completed().await?))
    }

    /// Completed tasks in percent, rounded to `decimals`
    pub async fn tasks_progress(&self, decimals: u32) -> Result<f64, ProcessError> {
        Ok(progress(
            self.tasks_completed().await?,
            self.tasks_count().await?,
            decimals,
        ))
    }

    /// Completed batches in percent, rounded to `decimals`
    pub async fn batches_progress(&self, decimals: u32) -> Result<f64, ProcessError> {
        Ok(progress(
            self.batches_completed().await?,
            self.batches_count().await?,
            decimals,
        ))
    }

    // =========================================================================
    // Internals shared with the run loop
    // =========================================================================

    async fn read_abort_flag(&self) -> Result<bool, StoreError> {
        let flag = self.store.get(&self.keys.abort()).await?;
        Ok(matches!(flag, Some(Value::Bool(true))))
    }

    /// Delete the abort flag, the first-start time and every counter
    async fn delete_options(&self) -> Result<(), StoreError> {
        for key in self.keys.options() {
            self.store.delete(&key).await?;
        }
        self.stats.invalidate();
        Ok(())
    }

    async fn emit(&self, event: ProcessEvent) {
        self.listener.on_event(self.name(), &event).await;
    }
}

impl std::fmt::Debug for BackgroundProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcess")
            .field("name", &self.name())
            .field("config", &self.config)
            .field("in_run", &self.current_run.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn process() -> BackgroundProcess {
        BackgroundProcess::new(
            ProcessConfig::new("test").with_batch_size(10),
            Arc::new(InMemoryStore::new()),
            Arc::new(handler_fn(|_| async { TaskOutcome::Succeeded })),
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = BackgroundProcess::new(
            ProcessConfig::new("bad name"),
            Arc::new(InMemoryStore::new()),
            Arc::new(handler_fn(|_| async { TaskOutcome::Succeeded })),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_tasks_counts_tasks_and_batches() {
        let process = process();

        let batches = process
            .add_tasks((0..25).map(|i| json!(i)).collect())
            .await
            .unwrap();

        assert_eq!(batches.count(), 3);
        assert_eq!(process.tasks_count().await.unwrap(), 25);
        assert_eq!(process.batches_count().await.unwrap(), 3);
        assert_eq!(process.tasks_left().await.unwrap(), 25);
        assert_eq!(process.tasks_progress(0).await.unwrap(), 0.0);
        assert!(process.is_in_progress().await.unwrap());
        assert!(!process.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_cancel_wipes_everything() {
        let process = process();
        process.add_tasks(vec![json!(1), json!(2)]).await.unwrap();

        process.cancel().await.unwrap();
        process.cancel().await.unwrap();

        assert!(process.is_empty_queue().await.unwrap());
        assert_eq!(process.tasks_count().await.unwrap(), 0);
        assert!(!process.is_aborting().await.unwrap());
        assert_eq!(process.tasks_progress(0).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_touch_on_empty_queue_does_nothing() {
        let process = process();
        assert!(!process.touch(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_restarts_stalled_queue() {
        let process = process();
        process.add_tasks(vec![json!(1)]).await.unwrap();

        assert!(process.touch(false).await.unwrap());
    }
}
