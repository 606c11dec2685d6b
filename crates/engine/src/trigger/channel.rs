//! In-process wake-up transport
//!
//! For hosts that keep a long-lived runtime: wake-ups travel over a tokio
//! channel to a task that calls `maybe_handle`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{TriggerError, WakeTransport};
use crate::process::BackgroundProcess;

/// Create a connected transport/receiver pair
///
/// At most `buffer` wake-ups wait at once; more are dropped since one
/// pending wake-up is as good as many.
pub fn wake_channel(buffer: usize) -> (ChannelWakeTransport, WakeReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (ChannelWakeTransport { tx }, WakeReceiver { rx })
}

/// Sending half of [`wake_channel`]
#[derive(Debug, Clone)]
pub struct ChannelWakeTransport {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl WakeTransport for ChannelWakeTransport {
    async fn trigger(&self, process: &str) -> Result<(), TriggerError> {
        match self.tx.try_send(process.to_string()) {
            Ok(()) => {
                debug!(%process, "wake-up queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(%process, "wake-up already pending");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TriggerError::Disconnected),
        }
    }
}

/// Receiving half of [`wake_channel`]
#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<String>,
}

impl WakeReceiver {
    /// Run `process` once per wake-up until every transport is dropped
    pub async fn serve(mut self, process: Arc<BackgroundProcess>) {
        info!(process = %process.name(), "serving wake-ups");

        while let Some(name) = self.rx.recv().await {
            if name != process.name() {
                warn!(process = %process.name(), requested = %name, "wake-up for unknown process");
                continue;
            }

            match process.maybe_handle().await {
                Ok(outcome) => debug!(process = %name, ?outcome, "wake-up handled"),
                Err(e) => error!(process = %name, error = %e, "run failed"),
            }
        }

        info!(process = %process.name(), "wake-up channel closed");
    }

    /// Next pending wake-up, `None` once every transport is dropped
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// A pending wake-up without waiting
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}
