// Shared harness for controller integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchrun_engine::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Transport that records wake-ups instead of sending them
#[derive(Default)]
pub struct RecordingTransport {
    pub triggered: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingTransport {
    pub fn count(&self) -> usize {
        self.triggered.lock().len()
    }
}

#[async_trait]
impl WakeTransport for RecordingTransport {
    async fn trigger(&self, process: &str) -> Result<(), TriggerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TriggerError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.triggered.lock().push(process.to_string());
        Ok(())
    }
}

/// Health check that only remembers whether it is scheduled
#[derive(Default)]
pub struct FlagHealthCheck {
    scheduled: AtomicBool,
}

impl HealthCheck for FlagHealthCheck {
    fn schedule(&self) {
        self.scheduled.store(true, Ordering::SeqCst);
    }

    fn unschedule(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }
}

/// Listener recording every event
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ProcessEvent>>,
}

impl RecordingListener {
    pub fn types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.types().into_iter().filter(|t| *t == event_type).count()
    }
}

#[async_trait]
impl EventListener for RecordingListener {
    async fn on_event(&self, _process: &str, event: &ProcessEvent) {
        self.events.lock().push(event.clone());
    }
}

pub struct Harness {
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<ManualClock>,
    pub memory: Arc<FixedMemoryProbe>,
    pub transport: Arc<RecordingTransport>,
    pub health: Arc<FlagHealthCheck>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(ManualClock::default()),
            memory: Arc::new(FixedMemoryProbe::new(0)),
            transport: Arc::new(RecordingTransport::default()),
            health: Arc::new(FlagHealthCheck::default()),
            listener: Arc::new(RecordingListener::default()),
        }
    }

    /// A process wired to this harness's collaborators
    pub fn process(&self, config: ProcessConfig, handler: Arc<dyn TaskHandler>) -> BackgroundProcess {
        BackgroundProcess::new(config, self.store.clone(), handler)
            .unwrap()
            .with_transport(self.transport.clone())
            .with_health_check(self.health.clone())
            .with_listener(self.listener.clone())
            .with_host_limits(Arc::new(FixedHostLimits::default()))
            .with_memory_probe(self.memory.clone())
            .with_clock(self.clock.clone())
    }

    /// Handler that records each workload and advances the clock one second
    pub fn ticking_handler(&self) -> (Arc<dyn TaskHandler>, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let clock = self.clock.clone();
        let recorded = seen.clone();

        let handler = handler_fn(move |workload: Value| {
            let clock = clock.clone();
            let recorded = recorded.clone();
            async move {
                recorded.lock().push(workload);
                clock.advance(Duration::from_secs(1));
                TaskOutcome::Succeeded
            }
        });

        (Arc::new(handler), seen)
    }

    /// Every task still persisted, in queue order
    pub async fn pending_tasks(&self, process: &BackgroundProcess) -> Vec<Value> {
        let mut tasks = vec![];
        for key in self
            .store
            .scan_prefix(&process.keys().batch_prefix())
            .await
            .unwrap()
        {
            if let Some(Value::Array(batch)) = self.store.get(&key).await.unwrap() {
                tasks.extend(batch);
            }
        }
        tasks
    }
}

/// Config allowing `tasks` one-second tasks per run
pub fn config_for_tasks_per_run(tasks: u64) -> ProcessConfig {
    let reserve = Duration::from_secs(10);
    ProcessConfig::new("test").with_budget(
        BudgetConfig::new()
            .with_max_execution_time(Duration::from_secs(tasks) + reserve)
            .with_time_reserve(reserve),
    )
}

pub fn numbered(n: u64) -> Vec<Value> {
    (0..n).map(|i| json!(i)).collect()
}
