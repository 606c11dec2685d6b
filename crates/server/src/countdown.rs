// Demo task handler
//
// `{"n": k}` requeues `{"n": k - 1}` until it reaches zero, so one enqueued
// task turns into k + 1 handled tasks.

use batchrun_engine::{handler_fn, TaskHandler, TaskOutcome};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub fn countdown_handler() -> impl TaskHandler {
    handler_fn(|workload: Value| async move { count_down(&workload) })
}

fn count_down(workload: &Value) -> TaskOutcome {
    match workload.get("n").and_then(Value::as_u64) {
        Some(0) => {
            debug!("countdown finished");
            TaskOutcome::Succeeded
        }
        Some(n) => TaskOutcome::requeue(json!({ "n": n - 1 })),
        None => {
            warn!(%workload, "countdown workload needs a non-negative \"n\"");
            TaskOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_down_to_zero() {
        let handler = countdown_handler();

        assert_eq!(
            handler.handle(json!({"n": 2})).await,
            TaskOutcome::requeue(json!({"n": 1}))
        );
        assert_eq!(handler.handle(json!({"n": 0})).await, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_malformed_workload_fails() {
        let handler = countdown_handler();

        assert_eq!(handler.handle(json!("ten")).await, TaskOutcome::Failed);
        assert_eq!(handler.handle(json!({"n": -1})).await, TaskOutcome::Failed);
    }
}
