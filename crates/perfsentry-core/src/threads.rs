//! Thread snapshots, thread health scoring and the deadlock heuristic.
//!
//! The sampler pulls a [`ThreadSnapshot`] from the host's
//! [`ThreadEnumerator`] on every tick and keeps a bounded history. Health is
//! a penalty score over the latest snapshot. Deadlock detection compares the
//! two most recent snapshots: threads blocked in both are suspects.
//!
//! Neither result is proof. Idle worker pools park for long stretches and
//! look exactly like the deadlock signal; treat candidates as leads.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{ensure_capacity, ensure_fixed_capacity, ensure_in_range, ensure_positive_ms};
use crate::error::ConfigError;
use crate::events::{Finding, FindingBus};
use crate::host::ThreadEnumerator;
use crate::ring_buffer::{RingBufferStats, SampleRingBuffer};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    /// Snapshots kept in history.
    pub history_capacity: usize,
    /// More live threads than this is a high-severity issue.
    pub max_thread_count: usize,
    /// Primary-thread CPU above this is a high-severity issue.
    pub primary_cpu_threshold_pct: f64,
    /// Any other thread above this is a medium-severity issue.
    pub thread_cpu_threshold_pct: f64,
    /// Threads that must stay blocked across two snapshots to suspect a deadlock.
    pub min_deadlock_threads: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 500,
            history_capacity: 120,
            max_thread_count: 64,
            primary_cpu_threshold_pct: 50.0,
            thread_cpu_threshold_pct: 80.0,
            min_deadlock_threads: 2,
        }
    }
}

impl ThreadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive_ms("threads.sample_interval_ms", self.sample_interval_ms)?;
        ensure_capacity("threads.history_capacity", self.history_capacity)?;
        ensure_capacity("threads.max_thread_count", self.max_thread_count)?;
        ensure_capacity("threads.min_deadlock_threads", self.min_deadlock_threads)?;
        ensure_in_range(
            "threads.primary_cpu_threshold_pct",
            self.primary_cpu_threshold_pct,
            0.0,
            100.0,
        )?;
        ensure_in_range(
            "threads.thread_cpu_threshold_pct",
            self.thread_cpu_threshold_pct,
            0.0,
            100.0,
        )
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

/// Scheduler state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    /// Interruptible wait (sleeping on a lock, condvar, I/O readiness).
    Waiting,
    /// Uninterruptible wait, usually disk I/O.
    Uninterruptible,
    Stopped,
    /// Exited but not yet reaped.
    Halted,
    Unknown,
}

impl RunState {
    #[must_use]
    pub const fn is_blocked(self) -> bool {
        matches!(self, Self::Waiting | Self::Uninterruptible)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Uninterruptible => write!(f, "uninterruptible"),
            Self::Stopped => write!(f, "stopped"),
            Self::Halted => write!(f, "halted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: u64,
    pub name: Option<String>,
    /// Percent of one core since the previous enumeration.
    pub cpu_usage_pct: f64,
    pub run_state: RunState,
    pub is_primary_thread: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub threads: Vec<ThreadInfo>,
    pub timestamp_ms: u64,
}

impl ThreadSnapshot {
    #[must_use]
    pub fn blocked_ids(&self) -> BTreeSet<u64> {
        self.threads
            .iter()
            .filter(|t| t.run_state.is_blocked())
            .map(|t| t.thread_id)
            .collect()
    }

    #[must_use]
    pub fn primary(&self) -> Option<&ThreadInfo> {
        self.threads.iter().find(|t| t.is_primary_thread)
    }
}

// =============================================================================
// Health and deadlock reports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Medium,
    High,
}

impl IssueSeverity {
    const fn penalty(self) -> f64 {
        match self {
            Self::Medium => 10.0,
            Self::High => 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadIssueKind {
    ThreadCountExceeded,
    PrimaryThreadHighCpu,
    HighCpuThreads,
    MostThreadsBlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadIssue {
    pub kind: ThreadIssueKind,
    pub severity: IssueSeverity,
    pub description: String,
    pub thread_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadHealthReport {
    /// 100 minus 20 per high and 10 per medium issue, floored at 0.
    pub score: f64,
    pub issues: Vec<ThreadIssue>,
    pub thread_count: usize,
    pub blocked_count: usize,
    pub timestamp_ms: u64,
}

/// Threads blocked in two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockCandidate {
    pub involved_thread_ids: BTreeSet<u64>,
    pub detected_at_ms: u64,
    pub description: String,
    /// Always true: persistent waiting is not proof of a lock cycle.
    pub heuristic: bool,
}

/// Score one snapshot against the configured limits.
#[must_use]
pub fn analyze_health(snapshot: &ThreadSnapshot, config: &ThreadConfig) -> ThreadHealthReport {
    let mut issues = Vec::new();
    let thread_count = snapshot.threads.len();

    if thread_count > config.max_thread_count {
        issues.push(ThreadIssue {
            kind: ThreadIssueKind::ThreadCountExceeded,
            severity: IssueSeverity::High,
            description: format!(
                "{thread_count} live threads exceeds limit of {}",
                config.max_thread_count
            ),
            thread_ids: Vec::new(),
        });
    }

    if let Some(primary) = snapshot.primary() {
        if primary.cpu_usage_pct > config.primary_cpu_threshold_pct {
            issues.push(ThreadIssue {
                kind: ThreadIssueKind::PrimaryThreadHighCpu,
                severity: IssueSeverity::High,
                description: format!(
                    "primary thread at {:.1}% CPU (limit {:.1}%)",
                    primary.cpu_usage_pct, config.primary_cpu_threshold_pct
                ),
                thread_ids: vec![primary.thread_id],
            });
        }
    }

    let hot: Vec<u64> = snapshot
        .threads
        .iter()
        .filter(|t| !t.is_primary_thread && t.cpu_usage_pct > config.thread_cpu_threshold_pct)
        .map(|t| t.thread_id)
        .collect();
    if !hot.is_empty() {
        issues.push(ThreadIssue {
            kind: ThreadIssueKind::HighCpuThreads,
            severity: IssueSeverity::Medium,
            description: format!(
                "{} thread(s) above {:.1}% CPU",
                hot.len(),
                config.thread_cpu_threshold_pct
            ),
            thread_ids: hot,
        });
    }

    let blocked: Vec<u64> = snapshot.blocked_ids().into_iter().collect();
    let blocked_count = blocked.len();
    if blocked_count * 2 > thread_count {
        issues.push(ThreadIssue {
            kind: ThreadIssueKind::MostThreadsBlocked,
            severity: IssueSeverity::Medium,
            description: format!("{blocked_count} of {thread_count} threads blocked"),
            thread_ids: blocked,
        });
    }

    let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
    ThreadHealthReport {
        score: (100.0 - penalty).max(0.0),
        issues,
        thread_count,
        blocked_count,
        timestamp_ms: snapshot.timestamp_ms,
    }
}

/// Compare two consecutive snapshots for threads blocked in both.
#[must_use]
pub fn detect_deadlock(
    previous: &ThreadSnapshot,
    current: &ThreadSnapshot,
    min_threads: usize,
) -> Option<DeadlockCandidate> {
    let before = previous.blocked_ids();
    let involved: BTreeSet<u64> = current
        .blocked_ids()
        .intersection(&before)
        .copied()
        .collect();
    if involved.len() < min_threads {
        return None;
    }
    Some(DeadlockCandidate {
        description: format!(
            "{} thread(s) blocked across consecutive snapshots",
            involved.len()
        ),
        involved_thread_ids: involved,
        detected_at_ms: current.timestamp_ms,
        heuristic: true,
    })
}

// =============================================================================
// Sampler
// =============================================================================

/// Periodic thread sampler with bounded snapshot history.
pub struct ThreadSnapshotSampler {
    config: RwLock<ThreadConfig>,
    enumerator: Option<Arc<dyn ThreadEnumerator>>,
    history: SampleRingBuffer<ThreadSnapshot>,
    latest_report: RwLock<Option<ThreadHealthReport>>,
    latest_deadlock: RwLock<Option<DeadlockCandidate>>,
    failures: AtomicU64,
    clock: SharedClock,
    bus: FindingBus,
}

impl ThreadSnapshotSampler {
    #[must_use]
    pub fn new(
        config: ThreadConfig,
        enumerator: Option<Arc<dyn ThreadEnumerator>>,
        clock: SharedClock,
        bus: FindingBus,
    ) -> Self {
        let history = SampleRingBuffer::new(config.history_capacity.max(1));
        Self {
            config: RwLock::new(config),
            enumerator,
            history,
            latest_report: RwLock::new(None),
            latest_deadlock: RwLock::new(None),
            failures: AtomicU64::new(0),
            clock,
            bus,
        }
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.enumerator.is_some()
    }

    /// Enumerate threads and append the snapshot to history.
    ///
    /// Returns `None` when no enumerator is registered or the call failed;
    /// the tick is skipped and nothing is appended.
    pub fn capture(&self) -> Option<ThreadSnapshot> {
        let enumerator = self.enumerator.as_ref()?;
        match enumerator.enumerate_live_threads() {
            Ok(threads) => {
                let snapshot = ThreadSnapshot {
                    threads,
                    timestamp_ms: self.clock.epoch_ms(),
                };
                self.history.push(snapshot.clone());
                Some(snapshot)
            }
            Err(err) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(subsystem = "threads", error = %err, failures, "Thread enumeration failed; skipping tick");
                None
            }
        }
    }

    /// One full tick: capture, score, and check for deadlocks.
    pub fn sample(&self) -> Option<ThreadHealthReport> {
        let snapshot = self.capture()?;
        let report = analyze_health(&snapshot, &self.config.read());
        debug!(
            subsystem = "threads",
            threads = report.thread_count,
            blocked = report.blocked_count,
            score = report.score,
            "Thread snapshot analyzed"
        );
        *self.latest_report.write() = Some(report.clone());
        self.detect_deadlock();
        Some(report)
    }

    /// Run the deadlock heuristic over the two newest snapshots.
    ///
    /// A candidate is published when its thread set differs from the one
    /// already reported, so a persisting condition is reported once.
    pub fn detect_deadlock(&self) -> Option<DeadlockCandidate> {
        let recent = self.history.last_n(2);
        let [previous, current] = recent.as_slice() else {
            return None;
        };
        let min_threads = self.config.read().min_deadlock_threads;
        let candidate = detect_deadlock(previous, current, min_threads);

        let mut latest = self.latest_deadlock.write();
        let is_new = match (&candidate, latest.as_ref()) {
            (Some(found), Some(known)) => found.involved_thread_ids != known.involved_thread_ids,
            (Some(_), None) => true,
            (None, _) => false,
        };
        latest.clone_from(&candidate);
        drop(latest);

        if is_new {
            if let Some(found) = &candidate {
                warn!(
                    subsystem = "threads",
                    threads = ?found.involved_thread_ids,
                    "Possible deadlock: threads blocked across consecutive snapshots"
                );
                self.bus.publish(Finding::DeadlockSuspected(found.clone()));
            }
        }
        candidate
    }

    #[must_use]
    pub fn latest_snapshot(&self) -> Option<ThreadSnapshot> {
        self.history.latest()
    }

    #[must_use]
    pub fn latest_report(&self) -> Option<ThreadHealthReport> {
        self.latest_report.read().clone()
    }

    /// The deadlock candidate still standing after the last tick.
    #[must_use]
    pub fn latest_deadlock(&self) -> Option<DeadlockCandidate> {
        self.latest_deadlock.read().clone()
    }

    #[must_use]
    pub fn history(&self) -> Vec<ThreadSnapshot> {
        self.history.snapshot()
    }

    #[must_use]
    pub fn history_stats(&self) -> RingBufferStats {
        self.history.stats()
    }

    /// Enumeration failures since creation.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.history.clear();
        *self.latest_report.write() = None;
        *self.latest_deadlock.write() = None;
    }

    #[must_use]
    pub fn config(&self) -> ThreadConfig {
        self.config.read().clone()
    }

    /// Validate `config` as a replacement for the current one.
    pub fn check_update(&self, config: &ThreadConfig) -> Result<(), ConfigError> {
        config.validate()?;
        ensure_fixed_capacity(
            "threads.history_capacity",
            self.history.capacity(),
            config.history_capacity,
        )
    }

    /// Replace limits. `history_capacity` must stay as constructed.
    pub fn configure(&self, config: ThreadConfig) -> Result<(), ConfigError> {
        self.check_update(&config)?;
        *self.config.write() = config;
        Ok(())
    }
}

impl std::fmt::Debug for ThreadSnapshotSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSnapshotSampler")
            .field("supported", &self.is_supported())
            .field("history", &self.history.len())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::HostError;
    use crate::events::FindingKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn thread(id: u64, state: RunState, cpu: f64) -> ThreadInfo {
        ThreadInfo {
            thread_id: id,
            name: None,
            cpu_usage_pct: cpu,
            run_state: state,
            is_primary_thread: id == 1,
        }
    }

    fn snapshot(threads: Vec<ThreadInfo>) -> ThreadSnapshot {
        ThreadSnapshot {
            threads,
            timestamp_ms: 0,
        }
    }

    /// Replays scripted enumerations, then fails.
    struct Scripted(Mutex<VecDeque<Vec<ThreadInfo>>>);

    impl ThreadEnumerator for Scripted {
        fn enumerate_live_threads(&self) -> Result<Vec<ThreadInfo>, HostError> {
            self.0
                .lock()
                .pop_front()
                .ok_or_else(|| HostError::Failed("script exhausted".to_string()))
        }
    }

    fn sampler(script: Vec<Vec<ThreadInfo>>, bus: &FindingBus) -> ThreadSnapshotSampler {
        let enumerator: Arc<dyn ThreadEnumerator> = Arc::new(Scripted(Mutex::new(script.into())));
        ThreadSnapshotSampler::new(
            ThreadConfig::default(),
            Some(enumerator),
            Arc::new(ManualClock::default()),
            bus.clone(),
        )
    }

    #[test]
    fn healthy_snapshot_scores_100() {
        let snap = snapshot(vec![
            thread(1, RunState::Running, 10.0),
            thread(2, RunState::Running, 5.0),
        ]);
        let report = analyze_health(&snap, &ThreadConfig::default());
        assert!((report.score - 100.0).abs() < f64::EPSILON);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn penalties_accumulate() {
        let config = ThreadConfig {
            max_thread_count: 3,
            ..ThreadConfig::default()
        };
        let snap = snapshot(vec![
            thread(1, RunState::Running, 75.0),
            thread(2, RunState::Running, 95.0),
            thread(3, RunState::Waiting, 0.0),
            thread(4, RunState::Waiting, 0.0),
            thread(5, RunState::Uninterruptible, 0.0),
        ]);
        let report = analyze_health(&snap, &config);
        // count (high) + primary cpu (high) + hot thread (medium) + blocked (medium)
        assert!((report.score - 40.0).abs() < f64::EPSILON);
        assert_eq!(report.issues.len(), 4);
        let hot = report
            .issues
            .iter()
            .find(|i| i.kind == ThreadIssueKind::HighCpuThreads)
            .unwrap();
        assert_eq!(hot.thread_ids, vec![2]);
    }

    #[test]
    fn every_issue_at_once_stays_in_range() {
        let config = ThreadConfig {
            max_thread_count: 1,
            primary_cpu_threshold_pct: 1.0,
            thread_cpu_threshold_pct: 1.0,
            ..ThreadConfig::default()
        };
        let snap = snapshot(vec![
            thread(1, RunState::Running, 99.0),
            thread(2, RunState::Waiting, 99.0),
            thread(3, RunState::Waiting, 99.0),
        ]);
        let report = analyze_health(&snap, &config);
        assert_eq!(report.issues.len(), 4);
        assert!((report.score - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_is_healthy() {
        let report = analyze_health(&snapshot(Vec::new()), &ThreadConfig::default());
        assert!((report.score - 100.0).abs() < f64::EPSILON);
        assert_eq!(report.blocked_count, 0);
    }

    #[test]
    fn deadlock_needs_repeat_blocking() {
        let a = snapshot(vec![
            thread(1, RunState::Running, 0.0),
            thread(2, RunState::Waiting, 0.0),
            thread(3, RunState::Waiting, 0.0),
        ]);
        let b = snapshot(vec![
            thread(1, RunState::Running, 0.0),
            thread(2, RunState::Waiting, 0.0),
            thread(3, RunState::Running, 0.0),
        ]);
        assert!(detect_deadlock(&a, &b, 2).is_none());

        let found = detect_deadlock(&a, &a, 2).unwrap();
        assert_eq!(found.involved_thread_ids, BTreeSet::from([2, 3]));
        assert!(found.heuristic);
    }

    #[test]
    fn sampler_publishes_deadlock_once() {
        let bus = FindingBus::new(16);
        let mut sub = bus.subscribe_to([FindingKind::DeadlockSuspected]);
        let stuck = vec![
            thread(1, RunState::Running, 0.0),
            thread(7, RunState::Waiting, 0.0),
            thread(8, RunState::Uninterruptible, 0.0),
        ];
        let sampler = sampler(vec![stuck.clone(), stuck.clone(), stuck], &bus);

        sampler.sample();
        assert!(sampler.latest_deadlock().is_none());
        sampler.sample();
        sampler.sample();
        assert!(sampler.latest_deadlock().is_some());
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn failed_enumeration_skips_tick() {
        let bus = FindingBus::default();
        let sampler = sampler(vec![vec![thread(1, RunState::Running, 0.0)]], &bus);
        assert!(sampler.sample().is_some());
        assert!(sampler.sample().is_none());
        assert_eq!(sampler.failures(), 1);
        assert_eq!(sampler.history().len(), 1);
    }

    #[test]
    fn missing_enumerator_is_unsupported() {
        let sampler = ThreadSnapshotSampler::new(
            ThreadConfig::default(),
            None,
            Arc::new(ManualClock::default()),
            FindingBus::default(),
        );
        assert!(!sampler.is_supported());
        assert!(sampler.capture().is_none());
        assert_eq!(sampler.failures(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let bus = FindingBus::default();
        let script = (0..10).map(|_| vec![thread(1, RunState::Running, 0.0)]).collect();
        let enumerator: Arc<dyn ThreadEnumerator> = Arc::new(Scripted(Mutex::new(script)));
        let config = ThreadConfig {
            history_capacity: 4,
            ..ThreadConfig::default()
        };
        let sampler =
            ThreadSnapshotSampler::new(config, Some(enumerator), Arc::new(ManualClock::default()), bus);
        for _ in 0..10 {
            sampler.capture();
        }
        let stats = sampler.history_stats();
        assert_eq!(stats.len, 4);
        assert_eq!(stats.total_pushed, 10);
    }

    #[test]
    fn configure_rejects_out_of_range_cpu() {
        let sampler = sampler(Vec::new(), &FindingBus::default());
        let bad = ThreadConfig {
            thread_cpu_threshold_pct: 150.0,
            ..ThreadConfig::default()
        };
        assert!(sampler.configure(bad).is_err());
    }

    #[test]
    fn configure_rejects_capacity_change() {
        let sampler = sampler(Vec::new(), &FindingBus::default());
        let resized = ThreadConfig {
            history_capacity: 500,
            max_thread_count: 8,
            ..ThreadConfig::default()
        };
        let err = sampler.configure(resized).unwrap_err();
        assert!(err.to_string().contains("threads.history_capacity is fixed"));
        assert_eq!(sampler.config().max_thread_count, 64);

        let limits_only = ThreadConfig {
            max_thread_count: 8,
            ..ThreadConfig::default()
        };
        sampler.configure(limits_only).unwrap();
        assert_eq!(sampler.config().max_thread_count, 8);
    }
}
