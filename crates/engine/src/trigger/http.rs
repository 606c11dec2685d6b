//! HTTP wake-up transport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, warn};

use super::{TriggerError, WakeNonce, WakeTransport};

/// Default timeout of one wake-up request
pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wakes a process by POSTing to `{base}/wake/{process}?nonce=...`
///
/// The receiving endpoint is expected to answer as soon as the run has been
/// started, not when it finishes.
#[derive(Clone)]
pub struct HttpWakeTransport {
    base_url: String,
    nonces: WakeNonce,
    client: Client,
    basic_auth: Option<Arc<(String, String)>>,
}

impl HttpWakeTransport {
    pub fn new(base_url: &str, nonces: WakeNonce) -> Result<Self, TriggerError> {
        Self::with_timeout(base_url, nonces, DEFAULT_WAKE_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        nonces: WakeNonce,
        timeout: Duration,
    ) -> Result<Self, TriggerError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            nonces,
            client,
            basic_auth: None,
        })
    }

    /// Send HTTP basic credentials with every wake-up
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(Arc::new((username.into(), password.into())));
        self
    }

    /// URL of the wake-up endpoint of `process`
    pub fn wake_url(&self, process: &str) -> String {
        format!("{}/wake/{}", self.base_url, process)
    }
}

#[async_trait]
impl WakeTransport for HttpWakeTransport {
    async fn trigger(&self, process: &str) -> Result<(), TriggerError> {
        let url = self.wake_url(process);
        let nonce = self.nonces.generate(process, Utc::now());

        let mut request = self.client.post(&url).query(&[("nonce", nonce)]);
        if let Some(auth) = &self.basic_auth {
            request = request.basic_auth(&auth.0, Some(&auth.1));
        }

        let response = request.send().await.map_err(|e| {
            warn!(%process, url = %url, error = %e, "wake-up request failed");
            TriggerError::Http(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%process, status = status.as_u16(), "wake-up rejected");
            return Err(TriggerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(%process, "wake-up dispatched");
        Ok(())
    }
}

impl std::fmt::Debug for HttpWakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpWakeTransport")
            .field("base_url", &self.base_url)
            .field("basic_auth", &self.basic_auth.is_some())
            .finish()
    }
}
