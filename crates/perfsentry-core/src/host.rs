//! Host capabilities.
//!
//! Every OS-specific input the engine needs sits behind one of these
//! traits, registered through [`HostCapabilities`]. A missing capability
//! turns its subsystem off instead of failing the engine.
//!
//! - **Linux**: [`ProcThreadEnumerator`] reads `/proc/self/task/<tid>/stat`;
//!   [`ProcHostCounters`] reads `/proc/meminfo` and `/proc/stat`
//! - **Other**: no built-in capabilities; hosts register their own

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::graph::ReferenceEnumerator;
use crate::threads::{RunState, ThreadInfo};

// =============================================================================
// Capability traits
// =============================================================================

/// List live threads of the current process.
pub trait ThreadEnumerator: Send + Sync {
    fn enumerate_live_threads(&self) -> Result<Vec<ThreadInfo>, HostError>;
}

/// Result of pinging the primary execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The context ran the ping after this long.
    Responded(Duration),
    /// No answer within the timeout.
    TimedOut,
    /// The context is gone or was never attached.
    Unavailable,
}

/// Run a no-op on the primary execution context and report the latency.
pub trait PrimaryContextPinger: Send + Sync {
    fn ping(&self, timeout: Duration) -> PingOutcome;
}

/// Callback invoked once per rendered frame with the frame timestamp.
pub type FrameCallback = Box<dyn Fn(Duration) + Send + Sync>;

/// Per-frame tick source, such as a display-link or compositor callback.
pub trait FrameClock: Send + Sync {
    fn on_tick(&self, callback: FrameCallback) -> Result<(), HostError>;
}

/// Coarse system counters. Any field the host cannot supply stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCounterSample {
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub cpu_usage_pct: Option<f64>,
    pub disk_usage_pct: Option<f64>,
    /// Fraction of recent network requests that succeeded, as a percent.
    pub network_success_pct: Option<f64>,
}

impl HostCounterSample {
    #[must_use]
    pub fn memory_usage_pct(&self) -> Option<f64> {
        match (self.memory_used_bytes, self.memory_total_bytes) {
            (Some(used), Some(total)) if total > 0 => Some(used as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

pub trait HostCounters: Send + Sync {
    fn sample(&self) -> Result<HostCounterSample, HostError>;
}

// =============================================================================
// Capability registry
// =============================================================================

/// The set of host capabilities an engine is built with.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub threads: Option<Arc<dyn ThreadEnumerator>>,
    pub primary: Option<Arc<dyn PrimaryContextPinger>>,
    pub references: Option<Arc<dyn ReferenceEnumerator>>,
    pub counters: Option<Arc<dyn HostCounters>>,
}

impl HostCapabilities {
    /// No capabilities; only the tracker and frame sampler do anything.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Built-in capabilities for the current platform.
    #[must_use]
    pub fn platform() -> Self {
        let mut host = Self::default();
        if cfg!(target_os = "linux") {
            host.threads = Some(Arc::new(ProcThreadEnumerator::new()));
            host.counters = Some(Arc::new(ProcHostCounters::new()));
        }
        host
    }

    #[must_use]
    pub fn with_threads(mut self, threads: Arc<dyn ThreadEnumerator>) -> Self {
        self.threads = Some(threads);
        self
    }

    #[must_use]
    pub fn with_primary(mut self, primary: Arc<dyn PrimaryContextPinger>) -> Self {
        self.primary = Some(primary);
        self
    }

    #[must_use]
    pub fn with_references(mut self, references: Arc<dyn ReferenceEnumerator>) -> Self {
        self.references = Some(references);
        self
    }

    #[must_use]
    pub fn with_counters(mut self, counters: Arc<dyn HostCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Names of registered capabilities, for startup logging.
    #[must_use]
    pub fn describe(&self) -> Vec<&'static str> {
        [
            ("threads", self.threads.is_some()),
            ("primary", self.primary.is_some()),
            ("references", self.references.is_some()),
            ("counters", self.counters.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCapabilities")
            .field("registered", &self.describe())
            .finish()
    }
}

// =============================================================================
// Linux: /proc/self/task
// =============================================================================

/// Kernel clock ticks per second for `/proc` CPU counters (`USER_HZ`).
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Thread enumeration from `/proc/<pid>/task`.
///
/// CPU usage is the tick delta since the previous call, so the first
/// enumeration reports 0% for every thread.
pub struct ProcThreadEnumerator {
    task_dir: PathBuf,
    pid: u64,
    previous: Mutex<HashMap<u64, (u64, Instant)>>,
}

impl ProcThreadEnumerator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc/self", u64::from(std::process::id()))
    }

    /// Read `<process_dir>/task` instead of the live process.
    #[must_use]
    pub fn with_root(process_dir: impl Into<PathBuf>, pid: u64) -> Self {
        Self {
            task_dir: process_dir.into().join("task"),
            pid,
            previous: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ProcThreadEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadEnumerator for ProcThreadEnumerator {
    fn enumerate_live_threads(&self) -> Result<Vec<ThreadInfo>, HostError> {
        let entries = std::fs::read_dir(&self.task_dir).map_err(|e| {
            HostError::Unavailable(format!("{}: {e}", self.task_dir.display()))
        })?;
        let now = Instant::now();
        let mut previous = self.previous.lock();
        let mut seen = HashMap::new();
        let mut threads = Vec::new();

        for entry in entries.flatten() {
            let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            // Threads exit between read_dir and read; skip them.
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            let Some(parsed) = parse_task_stat(&stat) else {
                continue;
            };

            let cpu_usage_pct = previous
                .get(&tid)
                .map_or(0.0, |&(ticks, at)| cpu_percent(ticks, parsed.cpu_ticks, now - at));
            seen.insert(tid, (parsed.cpu_ticks, now));
            threads.push(ThreadInfo {
                thread_id: tid,
                name: Some(parsed.name),
                cpu_usage_pct,
                run_state: parsed.state,
                is_primary_thread: tid == self.pid,
            });
        }

        *previous = seen;
        threads.sort_by_key(|t| t.thread_id);
        Ok(threads)
    }
}

fn cpu_percent(before: u64, after: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let used = after.saturating_sub(before) as f64 / CLOCK_TICKS_PER_SEC;
    (used / secs * 100.0).max(0.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskStat {
    name: String,
    state: RunState,
    cpu_ticks: u64,
}

/// Parse `/proc/<pid>/task/<tid>/stat`: "tid (name) state ppid ... utime stime ...".
fn parse_task_stat(stat: &str) -> Option<TaskStat> {
    // Name can contain spaces and parens, so find the last ')'.
    let name_start = stat.find('(')?;
    let name_end = stat.rfind(')')?;
    let name = stat.get(name_start + 1..name_end)?.to_string();
    let fields: Vec<&str> = stat.get(name_end + 1..)?.split_whitespace().collect();
    // fields[0] = state; utime and stime are stat fields 14 and 15.
    let state = fields.first().map_or(RunState::Unknown, |s| parse_run_state(s));
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(TaskStat {
        name,
        state,
        cpu_ticks: utime + stime,
    })
}

fn parse_run_state(s: &str) -> RunState {
    match s {
        "R" => RunState::Running,
        "S" => RunState::Waiting,
        "D" => RunState::Uninterruptible,
        "T" | "t" => RunState::Stopped,
        "Z" | "X" => RunState::Halted,
        _ => RunState::Unknown,
    }
}

// =============================================================================
// Linux: /proc/meminfo + /proc/stat
// =============================================================================

/// Memory and CPU counters from `/proc`.
///
/// CPU usage is system-wide busy time since the previous sample, so the
/// first sample has `cpu_usage_pct: None`.
pub struct ProcHostCounters {
    root: PathBuf,
    previous_cpu: Mutex<Option<CpuTimes>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

impl ProcHostCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous_cpu: Mutex::new(None),
        }
    }
}

impl Default for ProcHostCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCounters for ProcHostCounters {
    fn sample(&self) -> Result<HostCounterSample, HostError> {
        let meminfo = std::fs::read_to_string(self.root.join("meminfo"))
            .map_err(|e| HostError::Unavailable(format!("meminfo: {e}")))?;
        let (total_kb, available_kb) = parse_meminfo(&meminfo);

        let cpu_usage_pct = std::fs::read_to_string(self.root.join("stat"))
            .ok()
            .and_then(|stat| parse_cpu_times(&stat))
            .and_then(|current| {
                let previous = self.previous_cpu.lock().replace(current)?;
                let total = current.total.saturating_sub(previous.total);
                let busy = current.busy.saturating_sub(previous.busy);
                (total > 0).then(|| busy as f64 / total as f64 * 100.0)
            });

        Ok(HostCounterSample {
            memory_used_bytes: (total_kb > 0)
                .then(|| total_kb.saturating_sub(available_kb) * 1024),
            memory_total_bytes: (total_kb > 0).then_some(total_kb * 1024),
            cpu_usage_pct,
            disk_usage_pct: None,
            network_success_pct: None,
        })
    }
}

/// Total and available memory in kB.
fn parse_meminfo(contents: &str) -> (u64, u64) {
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in contents.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_value(val);
        } else if let Some(val) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_meminfo_value(val);
        }
    }
    (total_kb, available_kb)
}

fn parse_meminfo_value(s: &str) -> u64 {
    s.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .unwrap_or(0)
}

/// Aggregate "cpu" line: user nice system idle iowait irq softirq steal ...
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // guest time is already counted in user
    let total: u64 = values.iter().take(8).sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}
