//! Serializable snapshot of everything the engine has derived.

use serde::{Deserialize, Serialize};

use crate::aggregator::{Alert, HealthReport};
use crate::frames::{FrameRateReport, FrameSample};
use crate::graph::CycleReport;
use crate::lifecycle::{LeakCandidate, LifecycleStatistics};
use crate::ring_buffer::RingBufferStats;
use crate::threads::{DeadlockCandidate, ThreadHealthReport, ThreadSnapshot};
use crate::watchdog::WatchdogReport;

/// Which subsystems could run with the registered host capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportMatrix {
    pub lifecycle: bool,
    pub reference_cycles: bool,
    pub threads: bool,
    pub watchdog: bool,
    pub frames: bool,
    pub host_counters: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakSection {
    pub statistics: LifecycleStatistics,
    pub candidates: Vec<LeakCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSection {
    pub latest_snapshot: Option<ThreadSnapshot>,
    pub latest_report: Option<ThreadHealthReport>,
    /// Heuristic: threads repeatedly blocked, not a proven lock cycle.
    pub latest_deadlock: Option<DeadlockCandidate>,
    pub sample_failures: u64,
    pub history: RingBufferStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSection {
    pub report: FrameRateReport,
    pub history: Vec<FrameSample>,
}

/// Full engine state, as returned by `Engine::report()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub version: String,
    pub generated_at_ms: u64,
    pub running: bool,
    pub supported: SupportMatrix,
    pub leaks: LeakSection,
    pub cycles: Vec<CycleReport>,
    pub threads: ThreadSection,
    pub watchdog: WatchdogReport,
    pub frames: FrameSection,
    pub health: Option<HealthReport>,
    pub alerts: Vec<Alert>,
}

impl EngineReport {
    /// Pretty-printed JSON.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Number of findings currently flagged as heuristic.
    #[must_use]
    pub fn heuristic_findings(&self) -> usize {
        self.leaks.candidates.iter().filter(|c| c.heuristic).count()
            + usize::from(self.threads.latest_deadlock.as_ref().is_some_and(|d| d.heuristic))
    }
}
