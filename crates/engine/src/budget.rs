//! Per-run execution budget
//!
//! Computed once when a run starts, then asked on every task iteration
//! whether the run should stop before the host kills it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::debug;

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    /// Ceiling for one run's wall-clock time
    #[serde(with = "crate::duration_millis")]
    pub max_execution_time: Duration,

    /// Stop this long before the available time runs out
    #[serde(with = "crate::duration_millis")]
    pub time_reserve: Duration,

    /// Memory ceiling in bytes, used when the host reports no limit
    pub memory_limit: u64,

    /// Fraction of available memory that may be used, in (0, 1]
    pub memory_factor: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_secs(3600),
            time_reserve: Duration::from_secs(10),
            memory_limit: 2_000_000_000,
            memory_factor: 0.9,
        }
    }
}

impl BudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_execution_time(mut self, time: Duration) -> Self {
        self.max_execution_time = time;
        self
    }

    pub fn with_time_reserve(mut self, reserve: Duration) -> Self {
        self.time_reserve = reserve;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_memory_factor(mut self, factor: f64) -> Self {
        self.memory_factor = factor;
        self
    }
}

// =============================================================================
// Host collaborators
// =============================================================================

/// Execution time limit reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTimeLimit {
    Unlimited,
    Limited(Duration),
}

/// Ceilings imposed by the hosting environment
pub trait HostLimits: Send + Sync {
    /// Current execution time limit
    fn time_limit(&self) -> HostTimeLimit;

    /// Try to raise the execution time limit to `to`; returns whether it
    /// worked
    fn raise_time_limit(&self, to: Duration) -> bool;

    /// Memory limit in bytes, `None` when unlimited
    fn memory_limit(&self) -> Option<u64>;
}

/// Host limits of the current OS process
///
/// The memory ceiling comes from the cgroup the process lives in. There is no
/// OS-level wall-clock limit, so the platform's limit (a serverless timeout,
/// a proxy's request timeout, ...) is configured explicitly.
#[derive(Debug, Clone)]
pub struct ProcessHostLimits {
    time_limit: HostTimeLimit,
    raisable: bool,
    cgroup_root: PathBuf,
}

/// Values at or above this are how cgroup v1 spells "unlimited"
const CGROUP_V1_UNLIMITED: u64 = 1 << 60;

impl ProcessHostLimits {
    pub fn new(time_limit: HostTimeLimit) -> Self {
        Self {
            time_limit,
            raisable: false,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    /// Whether the platform lets a run extend its own time limit
    pub fn with_raisable(mut self, raisable: bool) -> Self {
        self.raisable = raisable;
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    fn read_cgroup_memory(&self) -> Option<u64> {
        // cgroup v2
        if let Ok(raw) = std::fs::read_to_string(self.cgroup_root.join("memory.max")) {
            let raw = raw.trim();
            return if raw == "max" { None } else { raw.parse().ok() };
        }

        // cgroup v1
        let raw =
            std::fs::read_to_string(self.cgroup_root.join("memory/memory.limit_in_bytes")).ok()?;
        raw.trim()
            .parse::<u64>()
            .ok()
            .filter(|&limit| limit < CGROUP_V1_UNLIMITED)
    }
}

impl Default for ProcessHostLimits {
    fn default() -> Self {
        Self::new(HostTimeLimit::Unlimited)
    }
}

impl HostLimits for ProcessHostLimits {
    fn time_limit(&self) -> HostTimeLimit {
        self.time_limit
    }

    fn raise_time_limit(&self, _to: Duration) -> bool {
        self.raisable
    }

    fn memory_limit(&self) -> Option<u64> {
        self.read_cgroup_memory()
    }
}

/// Fixed host limits, for tests and embedders that know their ceilings
#[derive(Debug, Clone)]
pub struct FixedHostLimits {
    pub time_limit: HostTimeLimit,
    pub raisable: bool,
    pub memory_limit: Option<u64>,
}

impl Default for FixedHostLimits {
    fn default() -> Self {
        Self {
            time_limit: HostTimeLimit::Unlimited,
            raisable: false,
            memory_limit: None,
        }
    }
}

impl HostLimits for FixedHostLimits {
    fn time_limit(&self) -> HostTimeLimit {
        self.time_limit
    }

    fn raise_time_limit(&self, _to: Duration) -> bool {
        self.raisable
    }

    fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }
}

/// Reports the memory currently used by the process
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Resident set size of the current process via sysinfo
pub struct SysinfoMemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );

        Self {
            pid,
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn used_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(self.pid).map_or(0, |p| p.memory())
    }
}

/// Memory probe returning a settable value
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    used: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
        }
    }

    pub fn set(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// ExecutionBudget
// =============================================================================

/// Time and memory available to one run
pub struct ExecutionBudget {
    available_time: Duration,
    available_memory: u64,
    time_reserve: Duration,
    memory_factor: f64,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
}

impl ExecutionBudget {
    /// Reconcile the configured ceilings with what the host reports
    ///
    /// Time: an unlimited host gets the configured ceiling; a configured
    /// ceiling tighter than the host's wins; a tighter host limit is raised to
    /// the configured ceiling when the host allows it and kept otherwise.
    ///
    /// Memory: the host limit when there is one, the configured ceiling when
    /// the host is unlimited.
    pub fn prepare(
        config: &BudgetConfig,
        host: &dyn HostLimits,
        clock: Arc<dyn Clock>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let available_time = match host.time_limit() {
            HostTimeLimit::Unlimited => config.max_execution_time,
            HostTimeLimit::Limited(limit) if limit.is_zero() => config.max_execution_time,
            HostTimeLimit::Limited(limit) if config.max_execution_time < limit => {
                config.max_execution_time
            }
            HostTimeLimit::Limited(limit) => {
                if host.raise_time_limit(config.max_execution_time) {
                    config.max_execution_time
                } else {
                    limit
                }
            }
        };

        let available_memory = host
            .memory_limit()
            .filter(|&limit| limit > 0)
            .unwrap_or(config.memory_limit);

        debug!(
            available_time_secs = available_time.as_secs(),
            available_memory, "prepared execution budget"
        );

        Self {
            available_time,
            available_memory,
            time_reserve: config.time_reserve,
            memory_factor: config.memory_factor,
            clock,
            memory,
        }
    }

    pub fn available_time(&self) -> Duration {
        self.available_time
    }

    pub fn available_memory(&self) -> u64 {
        self.available_memory
    }

    /// Time left before the hard ceiling, zero once past it
    pub fn time_left(&self, started_at: DateTime<Utc>) -> Duration {
        let elapsed = self
            .clock
            .now()
            .signed_duration_since(started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.available_time.saturating_sub(elapsed)
    }

    /// True once no more than the reserve is left
    pub fn time_exceeded(&self, started_at: DateTime<Utc>) -> bool {
        self.time_left(started_at) <= self.time_reserve
    }

    /// True once used memory reaches the allowed fraction
    pub fn memory_exceeded(&self) -> bool {
        let limit = self.available_memory as f64 * self.memory_factor;
        self.memory.used_bytes() as f64 >= limit
    }
}

impl std::fmt::Debug for ExecutionBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBudget")
            .field("available_time", &self.available_time)
            .field("available_memory", &self.available_memory)
            .field("time_reserve", &self.time_reserve)
            .field("memory_factor", &self.memory_factor)
            .finish()
    }
}
