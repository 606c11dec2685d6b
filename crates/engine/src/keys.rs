//! Logical key layout of one background process

/// Names of every durable key owned by one process
///
/// All keys are namespaced by the process name `{prefix}_{action}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessKeys {
    name: String,
}

impl ProcessKeys {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The process name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> String {
        format!("{}_lock", self.name)
    }

    pub fn abort(&self) -> String {
        format!("{}_abort", self.name)
    }

    pub fn started_at(&self) -> String {
        format!("{}_started_at", self.name)
    }

    /// Prefix shared by every batch key
    ///
    /// Must not be a prefix of any other key above: `{name}_batches_count`
    /// differs from `{name}_batch_` at the sixth character after the name.
    /// Keys of other processes stay outside it as long as no process name
    /// contains `_batch_` or ends with `_batch`, which config validation
    /// rejects.
    pub fn batch_prefix(&self) -> String {
        format!("{}_batch_", self.name)
    }

    pub fn stat(&self, suffix: &str) -> String {
        format!("{}_{}", self.name, suffix)
    }

    /// Every non-batch key deleted when a queue cycle ends
    pub fn options(&self) -> Vec<String> {
        let mut keys = vec![self.abort(), self.started_at()];
        keys.extend(crate::stats::Stat::ALL.iter().map(|s| self.stat(s.suffix())));
        keys
    }
}
