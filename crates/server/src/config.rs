// Server configuration from environment variables
//
// Every variable is optional except WAKE_SECRET; missing or unparsable values
// fall back to the process defaults.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use batchrun_engine::{BudgetConfig, HostTimeLimit, ProcessConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base URL this server is reachable at; wake-ups are sent here
    pub public_url: String,
    pub wake_secret: String,
    /// PostgreSQL store when set, in-memory otherwise
    pub database_url: Option<String>,
    pub host_time_limit: HostTimeLimit,
    pub process: ProcessConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());

        let wake_secret = var("WAKE_SECRET").context("WAKE_SECRET must be set")?;
        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let public_url = var("PUBLIC_URL").unwrap_or_else(|| default_public_url(&bind_addr));

        let mut process = ProcessConfig::default();
        if let Some(prefix) = var("PROCESS_PREFIX") {
            process = process.with_prefix(prefix);
        }
        if let Some(action) = var("PROCESS_ACTION") {
            process = process.with_action(action);
        }
        if let Some(size) = parsed("BATCH_SIZE") {
            process = process.with_batch_size(size as usize);
        }
        if let Some(minutes) = parsed("HEALTH_CHECK_MINUTES") {
            process = process.with_health_check_interval(Duration::from_secs(minutes * 60));
        }

        let mut budget = BudgetConfig::default();
        if let Some(secs) = parsed("MAX_EXECUTION_SECS") {
            budget = budget.with_max_execution_time(Duration::from_secs(secs));
        }
        if let Some(bytes) = parsed("MEMORY_LIMIT_BYTES") {
            budget = budget.with_memory_limit(bytes);
        }
        process = process.with_budget(budget);

        if let Err(e) = process.validate() {
            bail!("invalid process configuration: {e}");
        }

        let host_time_limit = match parsed("HOST_TIME_LIMIT_SECS") {
            Some(0) | None => HostTimeLimit::Unlimited,
            Some(secs) => HostTimeLimit::Limited(Duration::from_secs(secs)),
        };

        Ok(Self {
            bind_addr,
            public_url,
            wake_secret,
            database_url: var("DATABASE_URL"),
            host_time_limit,
            process,
        })
    }
}

/// Loopback URL for the bound port
fn default_public_url(bind_addr: &str) -> String {
    let port = bind_addr.rsplit(':').next().unwrap_or("9000");
    format!("http://127.0.0.1:{port}")
}
