//! Periodic health check
//!
//! Wake-ups can get lost and runs can die without re-triggering. While a queue
//! cycle is in progress, the health check wakes the process on a fixed period
//! so a stalled queue gets picked up again. Waking an active process is
//! harmless: the run lock turns it into a no-op.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::trigger::WakeTransport;

/// Recurring wake-up of one process
pub trait HealthCheck: Send + Sync {
    /// Start the recurring wake-up; a no-op when already scheduled
    fn schedule(&self);

    /// Stop the recurring wake-up; a no-op when not scheduled
    fn unschedule(&self);

    fn is_scheduled(&self) -> bool;
}

/// Health check that never fires
#[derive(Debug, Default)]
pub struct NoopHealthCheck;

impl HealthCheck for NoopHealthCheck {
    fn schedule(&self) {}

    fn unschedule(&self) {}

    fn is_scheduled(&self) -> bool {
        false
    }
}

/// Health check backed by a tokio interval task
///
/// The first wake-up fires one full period after scheduling, since whoever
/// scheduled it is already starting a run.
pub struct IntervalHealthCheck {
    process: String,
    period: Duration,
    transport: Arc<dyn WakeTransport>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalHealthCheck {
    pub fn new(process: impl Into<String>, period: Duration, transport: Arc<dyn WakeTransport>) -> Self {
        Self {
            process: process.into(),
            period,
            transport,
            task: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl HealthCheck for IntervalHealthCheck {
    fn schedule(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(process = %self.process, "no tokio runtime, health check not scheduled");
            return;
        };

        let process = self.process.clone();
        let period = self.period;
        let transport = self.transport.clone();

        *task = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                debug!(%process, "health check firing");
                if let Err(e) = transport.trigger(&process).await {
                    warn!(%process, error = %e, "health check wake-up failed");
                }
            }
        }));

        info!(process = %self.process, period_secs = period.as_secs(), "health check scheduled");
    }

    fn unschedule(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(process = %self.process, "health check unscheduled");
        }
    }

    fn is_scheduled(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for IntervalHealthCheck {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for IntervalHealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalHealthCheck")
            .field("process", &self.process)
            .field("period", &self.period)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::wake_channel;

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_period_after_the_first() {
        let (transport, mut receiver) = wake_channel(8);
        let check = IntervalHealthCheck::new("p", Duration::from_secs(60), Arc::new(transport));

        check.schedule();
        assert!(check.is_scheduled());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(receiver.try_recv(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(receiver.try_recv().as_deref(), Some("p"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(receiver.try_recv().as_deref(), Some("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent_and_unschedule_stops() {
        let (transport, mut receiver) = wake_channel(8);
        let check = IntervalHealthCheck::new("p", Duration::from_secs(10), Arc::new(transport));

        check.schedule();
        check.schedule();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(receiver.try_recv().as_deref(), Some("p"));
        assert_eq!(receiver.try_recv(), None);

        check.unschedule();
        check.unschedule();
        assert!(!check.is_scheduled());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(receiver.try_recv(), None);
    }

    #[test]
    fn test_noop_is_never_scheduled() {
        let check = NoopHealthCheck;
        check.schedule();
        assert!(!check.is_scheduled());
    }
}
