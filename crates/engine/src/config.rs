//! Process configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;

/// Longest allowed process name
///
/// Leaves room for the longest derived key (`_batches_completed`, or a batch
/// key with its 32-character id) under a 191-character key column.
pub const MAX_NAME_LEN: usize = 162;

/// Configuration error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration of one background process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Namespace shared by the processes of one application
    pub prefix: String,

    /// Name of this process within the namespace
    pub action: String,

    /// Maximum tasks per persisted batch
    pub batch_size: usize,

    /// Lifetime of the run lock between refreshes
    #[serde(with = "crate::duration_millis")]
    pub lock_ttl: Duration,

    /// Period of the health check that re-triggers a stalled queue
    #[serde(with = "crate::duration_millis")]
    pub health_check_interval: Duration,

    /// Persist the current batch after every task instead of only when a run
    /// stops mid-batch
    pub checkpoint_every_task: bool,

    /// Time and memory ceilings
    pub budget: BudgetConfig,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            prefix: "wpbg".to_string(),
            action: "process".to_string(),
            batch_size: 100,
            lock_ttl: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5 * 60),
            checkpoint_every_task: true,
            budget: BudgetConfig::default(),
        }
    }
}

impl ProcessConfig {
    /// Create a config with defaults for the given action
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    /// `{prefix}_{action}`
    pub fn name(&self) -> String {
        format!("{}_{}", self.prefix, self.action)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_checkpoint_every_task(mut self, enabled: bool) -> Self {
        self.checkpoint_every_task = enabled;
        self
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("prefix", &self.prefix)?;
        validate_identifier("action", &self.action)?;

        let name_len = self.name().len();
        if name_len > MAX_NAME_LEN {
            return Err(ConfigError::invalid(
                "action",
                format!("process name is {name_len} characters, at most {MAX_NAME_LEN} allowed"),
            ));
        }

        // Another process named `{x}_batch` or `{x}_batch_*` would have all
        // its keys under the batch prefix of process `{x}`
        let name = self.name();
        if name.ends_with("_batch") || name.contains("_batch_") {
            return Err(ConfigError::invalid(
                "action",
                format!("process name {name:?} overlaps the batch keys of another process"),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.lock_ttl.is_zero() {
            return Err(ConfigError::invalid("lock_ttl", "must be positive"));
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "health_check_interval",
                "must be positive",
            ));
        }

        let budget = &self.budget;
        if !(budget.memory_factor > 0.0 && budget.memory_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "memory_factor",
                format!("{} is outside (0, 1]", budget.memory_factor),
            ));
        }
        if budget.time_reserve >= budget.max_execution_time {
            return Err(ConfigError::invalid(
                "time_reserve",
                "must be shorter than max_execution_time",
            ));
        }

        Ok(())
    }
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(ConfigError::invalid(
            field,
            format!("illegal character {c:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.name(), "wpbg_process");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.health_check_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_builder() {
        let config = ProcessConfig::new("import")
            .with_prefix("shop")
            .with_batch_size(10)
            .with_lock_ttl(Duration::from_secs(5))
            .with_checkpoint_every_task(false);

        assert_eq!(config.name(), "shop_import");
        assert_eq!(config.batch_size, 10);
        assert!(!config.checkpoint_every_task);
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let err = ProcessConfig::new("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "action", .. }));

        let err = ProcessConfig::new("a b").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "action", .. }));

        let err = ProcessConfig::new("ok").with_prefix("x%").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "prefix", .. }));
    }

    #[test]
    fn test_rejects_names_inside_another_batch_prefix() {
        let import = ProcessConfig::new("import");
        assert!(import.validate().is_ok());

        // Every key of `wpbg_import_batch` starts with `wpbg_import_batch_`
        let sibling = ProcessConfig::new("import_batch");
        let err = sibling.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "action", .. }));

        assert!(ProcessConfig::new("import_batch_2").validate().is_err());
        assert!(ProcessConfig::new("batch_2").with_prefix("x").validate().is_err());
        assert!(ProcessConfig::new("batch").validate().is_err());

        assert!(ProcessConfig::new("batched_import").validate().is_ok());
        assert!(ProcessConfig::new("rebatch").validate().is_ok());
    }

    #[test]
    fn test_rejects_long_name() {
        let config = ProcessConfig::new("a".repeat(MAX_NAME_LEN));
        assert!(config.validate().is_err());

        let config = ProcessConfig::new("a".repeat(MAX_NAME_LEN - "wpbg_".len()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_numbers() {
        assert!(ProcessConfig::default().with_batch_size(0).validate().is_err());
        assert!(ProcessConfig::default()
            .with_lock_ttl(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ProcessConfig::default()
            .with_health_check_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ProcessConfig::default()
            .with_budget(BudgetConfig::new().with_memory_factor(1.5))
            .validate()
            .is_err());
        assert!(ProcessConfig::default()
            .with_budget(BudgetConfig::new().with_memory_factor(0.0))
            .validate()
            .is_err());
        assert!(ProcessConfig::default()
            .with_budget(
                BudgetConfig::new()
                    .with_max_execution_time(Duration::from_secs(10))
                    .with_time_reserve(Duration::from_secs(10))
            )
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_durations_as_millis() {
        let config = ProcessConfig::default();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["lock_ttl"], 30_000);
        assert_eq!(json["budget"]["time_reserve"], 10_000);

        let back: ProcessConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
