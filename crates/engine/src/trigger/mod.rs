//! Wake-up transports
//!
//! A wake-up asks some instance to call `maybe_handle` for a process. Wake-ups
//! are fire-and-forget and may be duplicated; the run lock absorbs
//! duplicates.

mod channel;
mod http;
mod nonce;

pub use channel::{wake_channel, ChannelWakeTransport, WakeReceiver};
pub use http::{HttpWakeTransport, DEFAULT_WAKE_TIMEOUT};
pub use nonce::{WakeNonce, DEFAULT_NONCE_WINDOW};

use async_trait::async_trait;
use tracing::debug;

/// Error dispatching a wake-up
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("wake-up request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("wake-up rejected with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("wake-up channel closed")]
    Disconnected,
}

/// Starts a new run of a process somewhere
#[async_trait]
pub trait WakeTransport: Send + Sync {
    /// Dispatch a wake-up for `process` without waiting for the run
    async fn trigger(&self, process: &str) -> Result<(), TriggerError>;
}

/// Transport that drops every wake-up
///
/// A process with this transport only advances when something else calls
/// `maybe_handle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWakeTransport;

#[async_trait]
impl WakeTransport for NoopWakeTransport {
    async fn trigger(&self, process: &str) -> Result<(), TriggerError> {
        debug!(%process, "wake-up dropped");
        Ok(())
    }
}
