//! # Resumable Batch Execution Engine
//!
//! Runs a large, growing list of tasks to completion in short runs that each
//! fit inside the host's time and memory ceilings. Work is persisted as
//! batches and a run that spends its budget wakes the next one.
//!
//! ## Features
//!
//! - **Resumable batches**: tasks are persisted in batches and picked up where the last run stopped
//! - **Execution budget**: each run stops a safety margin before the host's time or memory limit
//! - **Single active run**: a TTL lock in the store keeps at most one run per process
//! - **Growable tasks**: a task can requeue a new workload at the tail of its batch
//! - **Self-continuation**: runs re-trigger themselves; a periodic health check recovers lost wake-ups
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BackgroundProcess                         │
//! │  (run loop: lock, budget, consume batches, re-trigger)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//! ┌─────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ BatchSet        │  │ RunLock          │  │ WakeTransport    │
//! │ StatsTracker    │  │ ExecutionBudget  │  │ HealthCheck      │
//! └─────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                    │
//!          ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     KeyValueStore                            │
//! │  (in-memory for tests, PostgreSQL for production)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use batchrun_engine::prelude::*;
//!
//! let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
//! let (transport, receiver) = wake_channel(16);
//!
//! let process = Arc::new(
//!     BackgroundProcess::new(
//!         ProcessConfig::new("import"),
//!         store,
//!         Arc::new(handler_fn(|workload| async move {
//!             println!("{workload}");
//!             TaskOutcome::Succeeded
//!         })),
//!     )?
//!     .with_transport(Arc::new(transport)),
//! );
//!
//! tokio::spawn(receiver.serve(process.clone()));
//!
//! process.add_tasks(vec![json!({"id": 1}), json!({"id": 2})]).await?;
//! process.run().await?;
//! ```

pub mod budget;
pub mod config;
mod duration_millis;
pub mod health;
pub mod keys;
pub mod lock;
pub mod persistence;
pub mod process;
pub mod queue;
pub mod stats;
pub mod trigger;

/// Prelude for common imports
pub mod prelude {
    pub use crate::budget::{
        BudgetConfig, Clock, ExecutionBudget, FixedHostLimits, FixedMemoryProbe, HostLimits,
        HostTimeLimit, ManualClock, MemoryProbe, ProcessHostLimits, SysinfoMemoryProbe,
        SystemClock,
    };
    pub use crate::config::{ConfigError, ProcessConfig};
    pub use crate::health::{HealthCheck, IntervalHealthCheck, NoopHealthCheck};
    pub use crate::persistence::{InMemoryStore, KeyValueStore, PostgresStore, StoreError};
    pub use crate::process::{
        handler_fn, BackgroundProcess, EventListener, ProcessError, ProcessEvent, RunOutcome,
        SkipReason, TaskHandler, TaskOutcome,
    };
    pub use crate::trigger::{
        wake_channel, HttpWakeTransport, TriggerError, WakeNonce, WakeReceiver, WakeTransport,
    };
}

// Re-export key types at crate root
pub use budget::{
    BudgetConfig, Clock, ExecutionBudget, FixedHostLimits, FixedMemoryProbe, HostLimits,
    HostTimeLimit, ManualClock, MemoryProbe, ProcessHostLimits, SysinfoMemoryProbe, SystemClock,
};
pub use config::{ConfigError, ProcessConfig};
pub use health::{HealthCheck, IntervalHealthCheck, NoopHealthCheck};
pub use keys::ProcessKeys;
pub use lock::RunLock;
pub use persistence::{InMemoryStore, KeyValueStore, PostgresStore, StoreError};
pub use process::{
    handler_fn, BackgroundProcess, CompositeEventListener, EventListener, NoopEventListener,
    ProcessError, ProcessEvent, RunOutcome, SkipReason, TaskHandler, TaskOutcome,
};
pub use queue::BatchSet;
pub use stats::{progress, Stat, StatsTracker};
pub use trigger::{
    wake_channel, ChannelWakeTransport, HttpWakeTransport, NoopWakeTransport, TriggerError,
    WakeNonce, WakeReceiver, WakeTransport,
};
