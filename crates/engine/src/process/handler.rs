//! Pluggable task handler

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// What became of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Done; the task is removed
    Succeeded,

    /// Done but failed; the task is removed all the same
    Failed,

    /// Done, and this new workload goes to the tail of the batch
    Requeue(Value),
}

impl TaskOutcome {
    /// Interpret a loosely typed handler response
    ///
    /// Booleans map to success or failure. Anything empty (`null`, `""`, `0`,
    /// `[]`, `{}`) counts as finished rather than as a new task.
    pub fn from_response(response: Value) -> Self {
        match response {
            Value::Bool(true) => TaskOutcome::Succeeded,
            Value::Bool(false) => TaskOutcome::Failed,
            response if is_empty(&response) => TaskOutcome::Succeeded,
            response => TaskOutcome::Requeue(response),
        }
    }

    /// Requeue the workload, unless it is empty
    pub fn requeue(workload: impl Into<Value>) -> Self {
        match workload.into() {
            workload if is_empty(&workload) => TaskOutcome::Succeeded,
            workload => TaskOutcome::Requeue(workload),
        }
    }

    /// The workload to requeue, if any
    pub fn requeued(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Requeue(workload) if !is_empty(workload) => Some(workload),
            _ => None,
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Performs one task
///
/// Called once per task, in queue order, while the run holds the lock. There
/// is no timeout around a single call: the time budget is only checked after
/// it returns.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, workload: Value) -> TaskOutcome;
}

/// Task handler backed by an async closure
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`TaskHandler`]
///
/// ```ignore
/// let handler = handler_fn(|workload| async move {
///     println!("{workload}");
///     TaskOutcome::Succeeded
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    async fn handle(&self, workload: Value) -> TaskOutcome {
        (self.f)(workload).await
    }
}
