//! The run loop

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{BackgroundProcess, CurrentRun, ProcessError, ProcessEvent};
use crate::budget::ExecutionBudget;
use crate::persistence::StoreError;
use crate::queue::BatchSet;
use crate::stats::Stat;

/// Why a wake-up did not start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Nothing to do
    EmptyQueue,
    /// The run lock was already held
    AlreadyRunning,
    /// Another instance took the lock first
    LockContended,
}

/// What one wake-up did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped { reason: SkipReason },
    /// The budget ran out with work left; the next run was triggered
    Interrupted { tasks_done: u64 },
    /// The queue cycle is over
    Completed { cancelled: bool, tasks_done: u64 },
}

impl RunOutcome {
    fn skipped(reason: SkipReason) -> Self {
        RunOutcome::Skipped { reason }
    }
}

/// State of one run, dropped when the run ends
struct RunState {
    started_at: DateTime<Utc>,
    budget: ExecutionBudget,
    /// The abort flag was seen set; it stays set for the rest of the run
    aborting: bool,
    /// The stop condition fired; it stays fired for the rest of the run
    should_stop: bool,
    tasks_done: u64,
}

/// Marks this instance as inside a run until dropped
///
/// The marker is only cleared while it is still this run's: a run woken by
/// this one's re-trigger may have replaced it already.
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<CurrentRun>>,
    id: u64,
}

impl<'a> ActiveRun<'a> {
    fn enter(slot: &'a Mutex<Option<CurrentRun>>, id: u64, started_at: DateTime<Utc>) -> Self {
        *slot.lock() = Some(CurrentRun { id, started_at });
        Self { slot, id }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|run| run.id == self.id) {
            *slot = None;
        }
    }
}

impl BackgroundProcess {
    /// Entry point of every wake-up
    ///
    /// Runs the queue when it is not empty and no run is active. Returns as
    /// soon as the lock is lost or the run ends; never waits for a lock.
    #[instrument(skip(self), fields(process = %self.name()))]
    pub async fn maybe_handle(&self) -> Result<RunOutcome, ProcessError> {
        if self.is_empty_queue().await? {
            debug!("queue is empty");
            return Ok(RunOutcome::skipped(SkipReason::EmptyQueue));
        }

        // Cover this queue cycle even when the wake-up came from elsewhere
        self.health_check.schedule();

        if self.is_running().await? {
            debug!("already running");
            return Ok(RunOutcome::skipped(SkipReason::AlreadyRunning));
        }

        if !self.lock.acquire(self.config.lock_ttl).await? {
            info!("lost the lock to another instance");
            return Ok(RunOutcome::skipped(SkipReason::LockContended));
        }

        let started_at = self.clock.now();
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveRun::enter(&self.current_run, id, started_at);
        let result = self.handle(started_at).await;

        if let Err(e) = &result {
            if !matches!(e, ProcessError::Trigger(_)) {
                warn!(error = %e, "run failed, releasing lock");
                if let Err(release) = self.lock.release().await {
                    warn!(error = %release, "lock left to expire");
                }
            }
        }

        result
    }

    async fn handle(&self, started_at: DateTime<Utc>) -> Result<RunOutcome, ProcessError> {
        self.stats.invalidate();

        let budget = ExecutionBudget::prepare(
            &self.config.budget,
            &*self.host,
            self.clock.clone(),
            self.memory.clone(),
        );
        let mut run = RunState {
            started_at,
            budget,
            aborting: false,
            should_stop: false,
            tasks_done: 0,
        };

        info!(
            available_time_secs = run.budget.available_time().as_secs(),
            available_memory = run.budget.available_memory(),
            "run started"
        );

        self.before_start(started_at).await?;

        loop {
            self.handle_queue(&mut run).await?;

            if self.should_stop(&mut run).await? || self.is_empty_queue().await? {
                break;
            }
        }

        let aborting = self.check_aborting(&mut run).await?;
        if aborting {
            let removed = BatchSet::remove_all(&*self.store, &self.keys).await?;
            info!(removed, "queue wiped by cancellation");
        }

        self.emit(ProcessEvent::BeforeStop).await;
        self.lock.release().await?;

        if !self.is_empty_queue().await? {
            info!(tasks_done = run.tasks_done, "budget spent, re-triggering");
            self.transport.trigger(self.name()).await.map_err(|e| {
                warn!(error = %e, "re-trigger failed, health check will resume the queue");
                e
            })?;
            return Ok(RunOutcome::Interrupted {
                tasks_done: run.tasks_done,
            });
        }

        self.complete(aborting).await?;
        Ok(RunOutcome::Completed {
            cancelled: aborting,
            tasks_done: run.tasks_done,
        })
    }

    /// Record the first start of the queue cycle
    async fn before_start(&self, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        let key = self.keys.started_at();

        if !self.store.exists(&key).await? {
            self.store
                .set(&key, Value::String(started_at.to_rfc3339()))
                .await?;
            self.emit(ProcessEvent::BeforeFirstStart { started_at }).await;
        }

        self.emit(ProcessEvent::BeforeStart).await;
        Ok(())
    }

    /// One pass over every pending batch
    async fn handle_queue(&self, run: &mut RunState) -> Result<(), ProcessError> {
        let mut batches = BatchSet::load_pending(self.store.clone(), self.keys.clone()).await?;

        while let Some((batch, tasks)) = batches.current().await? {
            let mut tasks = VecDeque::from(tasks);
            let mut stop = false;

            while let Some(workload) = tasks.pop_front() {
                self.lock.refresh(self.config.lock_ttl).await?;

                let outcome = self.handler.handle(workload.clone()).await;

                if let Some(next) = outcome.requeued() {
                    tasks.push_back(next.clone());
                    // Fresh read: the queue may have grown outside this run
                    self.stats.increase(Stat::TasksCount, 1, true).await?;
                }

                self.stats.increase(Stat::TasksCompleted, 1, false).await?;
                run.tasks_done += 1;
                self.emit(ProcessEvent::TaskCompleted { workload, outcome })
                    .await;

                if self.should_stop(run).await? {
                    stop = true;
                    break;
                }

                if self.config.checkpoint_every_task && !tasks.is_empty() && !run.aborting {
                    batches.save_current(tasks.iter().cloned().collect()).await?;
                }
            }

            if tasks.is_empty() {
                batches.remove_batch(&batch).await?;
                self.stats.increase(Stat::BatchesCompleted, 1, false).await?;
                self.emit(ProcessEvent::BatchCompleted {
                    batch: batch.clone(),
                })
                .await;
            } else if !self.check_aborting(run).await? {
                debug!(%batch, tasks_left = tasks.len(), "saving interrupted batch");
                batches.save_current(tasks.into()).await?;
            }

            if stop || self.should_stop(run).await? {
                break;
            }

            batches.advance();
        }

        Ok(())
    }

    /// Whether the run must stop; once true it stays true
    async fn should_stop(&self, run: &mut RunState) -> Result<bool, StoreError> {
        if run.should_stop {
            return Ok(true);
        }

        let reason = if run.budget.time_exceeded(run.started_at) {
            Some("time")
        } else if run.budget.memory_exceeded() {
            Some("memory")
        } else if self.check_aborting(run).await? {
            Some("abort")
        } else {
            None
        };

        if let Some(reason) = reason {
            info!(process = %self.name(), reason, tasks_done = run.tasks_done, "stopping run");
            run.should_stop = true;
        }

        Ok(run.should_stop)
    }

    /// The abort flag, read from the store until it is first seen set
    async fn check_aborting(&self, run: &mut RunState) -> Result<bool, StoreError> {
        if !run.aborting {
            run.aborting = self.read_abort_flag().await?;
        }
        Ok(run.aborting)
    }

    async fn complete(&self, cancelled: bool) -> Result<(), StoreError> {
        if cancelled {
            self.emit(ProcessEvent::Cancelled).await;
        } else {
            self.emit(ProcessEvent::Succeeded).await;
        }
        self.emit(ProcessEvent::Completed { cancelled }).await;

        self.health_check.unschedule();
        self.delete_options().await?;

        info!(process = %self.name(), cancelled, "queue completed");
        Ok(())
    }
}
