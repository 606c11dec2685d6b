// Process lifecycle events
//
// Listeners are notified as a run moves through its states, so embedding
// applications can report progress or react to completion without
// subclassing the controller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::handler::TaskOutcome;

// ============================================================================
// ProcessEvent
// ============================================================================

/// Something that happened to a process
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// First run of a queue cycle is starting
    BeforeFirstStart { started_at: DateTime<Utc> },

    /// A run won the lock and is about to consume the queue
    BeforeStart,

    /// The handler returned for one task
    TaskCompleted { workload: Value, outcome: TaskOutcome },

    /// A batch ran out of tasks and was deleted
    BatchCompleted { batch: String },

    /// The run loop exited and the lock is about to be released
    BeforeStop,

    /// The queue drained without cancellation
    Succeeded,

    /// The queue was wiped by a cancellation
    Cancelled,

    /// The queue cycle is over; always follows `Succeeded` or `Cancelled`
    Completed { cancelled: bool },
}

impl ProcessEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ProcessEvent::BeforeFirstStart { .. } => "before_first_start",
            ProcessEvent::BeforeStart => "before_start",
            ProcessEvent::TaskCompleted { .. } => "task_completed",
            ProcessEvent::BatchCompleted { .. } => "batch_completed",
            ProcessEvent::BeforeStop => "before_stop",
            ProcessEvent::Succeeded => "succeeded",
            ProcessEvent::Cancelled => "cancelled",
            ProcessEvent::Completed { .. } => "completed",
        }
    }
}

// ============================================================================
// EventListener Trait
// ============================================================================

/// Receives the lifecycle events of a process
///
/// Listeners run inline in the run loop, between tasks. Keep them fast; a
/// slow listener eats into the run's time budget.
///
/// # Example
///
/// ```ignore
/// use batchrun_engine::{EventListener, ProcessEvent};
///
/// struct ProgressLogger;
///
/// #[async_trait]
/// impl EventListener for ProgressLogger {
///     async fn on_event(&self, process: &str, event: &ProcessEvent) {
///         if let ProcessEvent::Completed { cancelled } = event {
///             println!("{process} done, cancelled: {cancelled}");
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, process: &str, event: &ProcessEvent);

    /// Event types this listener wants, `None` for all of them
    fn event_types(&self) -> Option<Vec<&'static str>> {
        None
    }

    fn name(&self) -> &'static str {
        "EventListener"
    }
}

// ============================================================================
// NoopEventListener
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NoopEventListener;

#[async_trait]
impl EventListener for NoopEventListener {
    async fn on_event(&self, _process: &str, _event: &ProcessEvent) {}

    fn name(&self) -> &'static str {
        "NoopEventListener"
    }
}

// ============================================================================
// CompositeEventListener
// ============================================================================

/// Forwards events to several listeners in registration order
#[derive(Default)]
pub struct CompositeEventListener {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl CompositeEventListener {
    pub fn new(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl EventListener for CompositeEventListener {
    async fn on_event(&self, process: &str, event: &ProcessEvent) {
        for listener in &self.listeners {
            if let Some(types) = listener.event_types() {
                if !types.contains(&event.event_type()) {
                    continue;
                }
            }
            listener.on_event(process, event).await;
        }
    }

    fn name(&self) -> &'static str {
        "CompositeEventListener"
    }
}

// ============================================================================
// Tests
// ============================================================================
