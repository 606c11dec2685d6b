//! Wake-up nonces
//!
//! A nonce ties a wake-up call to one process and a time window, so only
//! holders of the shared secret can start runs. Nonces are not single-use.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Default lifetime of a nonce
pub const DEFAULT_NONCE_WINDOW: Duration = Duration::from_secs(12 * 3600);

/// Issues and checks nonces for wake-up calls
#[derive(Clone)]
pub struct WakeNonce {
    secret: String,
    window: Duration,
}

impl WakeNonce {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            window: DEFAULT_NONCE_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Nonce for `process` valid at `now`
    pub fn generate(&self, process: &str, now: DateTime<Utc>) -> String {
        self.digest(process, self.tick(now))
    }

    /// Whether `nonce` was issued for `process` in the current or the previous
    /// half-window
    pub fn verify(&self, process: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        let tick = self.tick(now);

        [tick, tick.saturating_sub(1)]
            .iter()
            .any(|&t| constant_time_eq(self.digest(process, t).as_bytes(), nonce.as_bytes()))
    }

    fn tick(&self, now: DateTime<Utc>) -> u64 {
        let half = (self.window.as_secs() / 2).max(1);
        let secs = now.timestamp().max(0) as u64;
        secs.div_ceil(half)
    }

    fn digest(&self, process: &str, tick: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tick.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(process.as_bytes());
        hasher.update(b"|");
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for WakeNonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeNonce")
            .field("secret", &"[redacted]")
            .field("window", &self.window)
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_nonce_is_hex_sha256() {
        let nonce = WakeNonce::new("s3cret").generate("wpbg_process", at(1_700_000_000));
        assert_eq!(nonce.len(), 64);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_nonce_scoped_to_process_and_secret() {
        let now = at(1_700_000_000);
        let nonces = WakeNonce::new("s3cret");
        let nonce = nonces.generate("wpbg_process", now);

        assert!(nonces.verify("wpbg_process", &nonce, now));
        assert!(!nonces.verify("wpbg_other", &nonce, now));
        assert!(!WakeNonce::new("other").verify("wpbg_process", &nonce, now));
        assert!(!nonces.verify("wpbg_process", "", now));
    }

    #[test]
    fn test_nonce_expires_after_window() {
        let nonces = WakeNonce::new("s3cret").with_window(Duration::from_secs(100));
        let issued = at(1_000);
        let nonce = nonces.generate("p", issued);

        assert!(nonces.verify("p", &nonce, at(1_049)));
        assert!(nonces.verify("p", &nonce, at(1_050)));
        assert!(!nonces.verify("p", &nonce, at(1_101)));
    }
}
