//! Anomaly aggregation: composite health score and deduplicated alerts.
//!
//! Each tick folds the latest subsystem outputs and host counters into
//! [`AggregateMetrics`], scores them, raises threshold alerts, and turns
//! findings published since the previous tick into alerts. An alert kind
//! raised within `dedup_window_ms` of the same kind is suppressed.
//!
//! Signals the host cannot supply, and signals sampled longer ago than
//! `stale_after_ms`, are left out of the score and the remaining weights are
//! renormalized; [`DataCompleteness`] says which.

use std::collections::VecDeque;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{ensure_capacity, ensure_in_range, ensure_positive, ensure_positive_ms};
use crate::error::ConfigError;
use crate::events::{Finding, FindingBus, FindingKind, FindingSubscription};
use crate::frames::HitchSeverity;
use crate::lifecycle::LeakSeverity;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// =============================================================================
// Configuration
// =============================================================================

/// Per-signal weights of the composite health score. Must sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub memory: f64,
    pub cpu: f64,
    pub thread: f64,
    pub network: f64,
    /// Frame smoothness; off unless the host opts in.
    pub frame: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            memory: 0.3,
            cpu: 0.3,
            thread: 0.2,
            network: 0.2,
            frame: 0.0,
        }
    }
}

impl HealthWeights {
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.memory + self.cpu + self.thread + self.network + self.frame
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, weight) in [
            ("aggregator.weights.memory", self.memory),
            ("aggregator.weights.cpu", self.cpu),
            ("aggregator.weights.thread", self.thread),
            ("aggregator.weights.network", self.network),
            ("aggregator.weights.frame", self.frame),
        ] {
            ensure_in_range(field, weight, 0.0, 1.0)?;
        }
        if (self.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::invalid(format!(
                "aggregator.weights must sum to 1.0 (got {})",
                self.sum()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub memory_warning_pct: f64,
    pub memory_critical_pct: f64,
    pub cpu_warning_pct: f64,
    pub cpu_critical_pct: f64,
    /// FPS below this raises a warning.
    pub fps_warning: f64,
    /// FPS below this raises a critical alert.
    pub fps_critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            memory_warning_pct: 80.0,
            memory_critical_pct: 90.0,
            cpu_warning_pct: 80.0,
            cpu_critical_pct: 95.0,
            fps_warning: 30.0,
            fps_critical: 15.0,
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_in_range("aggregator.thresholds.memory_warning_pct", self.memory_warning_pct, 0.0, 100.0)?;
        ensure_in_range("aggregator.thresholds.memory_critical_pct", self.memory_critical_pct, 0.0, 100.0)?;
        ensure_in_range("aggregator.thresholds.cpu_warning_pct", self.cpu_warning_pct, 0.0, 100.0)?;
        ensure_in_range("aggregator.thresholds.cpu_critical_pct", self.cpu_critical_pct, 0.0, 100.0)?;
        ensure_positive("aggregator.thresholds.fps_warning", self.fps_warning)?;
        ensure_positive("aggregator.thresholds.fps_critical", self.fps_critical)?;
        if self.memory_warning_pct > self.memory_critical_pct
            || self.cpu_warning_pct > self.cpu_critical_pct
            || self.fps_critical > self.fps_warning
        {
            return Err(ConfigError::invalid(
                "aggregator.thresholds: warning levels must not be beyond critical levels",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// Same-kind alerts inside this window are suppressed.
    pub dedup_window_ms: u64,
    /// Alert history bound; oldest alerts drop first.
    pub max_alerts: usize,
    /// Minimum score movement that publishes a health change.
    pub health_change_epsilon: f64,
    /// Signals sampled longer ago than this are dropped from the tick.
    pub stale_after_ms: u64,
    pub weights: HealthWeights,
    pub thresholds: AlertThresholds,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 5000,
            dedup_window_ms: 5000,
            max_alerts: 100,
            health_change_epsilon: 1.0,
            stale_after_ms: 30_000,
            weights: HealthWeights::default(),
            thresholds: AlertThresholds::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive_ms("aggregator.tick_interval_ms", self.tick_interval_ms)?;
        ensure_capacity("aggregator.max_alerts", self.max_alerts)?;
        ensure_positive_ms("aggregator.stale_after_ms", self.stale_after_ms)?;
        ensure_in_range(
            "aggregator.health_change_epsilon",
            self.health_change_epsilon,
            0.0,
            100.0,
        )?;
        self.weights.validate()?;
        self.thresholds.validate()
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MemoryWarning,
    MemoryCritical,
    CpuWarning,
    CpuCritical,
    LowFps,
    CriticalFps,
    LeakSuspected,
    ReferenceCycle,
    DeadlockSuspected,
    MainThreadBlocked,
    SevereHitch,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MemoryWarning => "memory_warning",
            Self::MemoryCritical => "memory_critical",
            Self::CpuWarning => "cpu_warning",
            Self::CpuCritical => "cpu_critical",
            Self::LowFps => "low_fps",
            Self::CriticalFps => "critical_fps",
            Self::LeakSuspected => "leak_suspected",
            Self::ReferenceCycle => "reference_cycle",
            Self::DeadlockSuspected => "deadlock_suspected",
            Self::MainThreadBlocked => "main_thread_blocked",
            Self::SevereHitch => "severe_hitch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp_ms: u64,
}

// =============================================================================
// Metrics and scoring
// =============================================================================

/// Inputs to one aggregation tick. `None` means the signal is unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub memory_usage_pct: Option<f64>,
    pub cpu_usage_pct: Option<f64>,
    pub disk_usage_pct: Option<f64>,
    pub network_success_pct: Option<f64>,
    pub thread_health_score: Option<f64>,
    pub fps: Option<f64>,
    pub frame_smoothness: Option<f64>,
    pub potential_leaks: usize,
    pub deadlock_suspected: bool,
    pub sampled_at: SampleTimes,
}

/// Wall time, in epoch ms, each signal group was sampled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleTimes {
    /// Memory, CPU, disk and network.
    pub counters_ms: Option<u64>,
    /// Thread health and the deadlock flag.
    pub threads_ms: Option<u64>,
    /// FPS and smoothness.
    pub frames_ms: Option<u64>,
}

/// Signal groups dropped from a tick because their data was too old.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleSignals {
    pub counters: bool,
    pub threads: bool,
    pub frames: bool,
}

impl StaleSignals {
    #[must_use]
    pub const fn any(self) -> bool {
        self.counters || self.threads || self.frames
    }
}

impl AggregateMetrics {
    /// Clear every signal group sampled more than `stale_after_ms` before
    /// `now_ms`. Groups with no sample time are left as they are.
    pub fn drop_stale(&mut self, now_ms: u64, stale_after_ms: u64) -> StaleSignals {
        let is_stale = |at: Option<u64>| at.is_some_and(|at| now_ms.saturating_sub(at) > stale_after_ms);
        let stale = StaleSignals {
            counters: is_stale(self.sampled_at.counters_ms),
            threads: is_stale(self.sampled_at.threads_ms),
            frames: is_stale(self.sampled_at.frames_ms),
        };
        if stale.counters {
            self.memory_usage_pct = None;
            self.cpu_usage_pct = None;
            self.disk_usage_pct = None;
            self.network_success_pct = None;
        }
        if stale.threads {
            self.thread_health_score = None;
            self.deadlock_suspected = false;
        }
        if stale.frames {
            self.fps = None;
            self.frame_smoothness = None;
        }
        stale
    }
}

/// Which weighted signals contributed to the score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCompleteness {
    pub memory: bool,
    pub cpu: bool,
    pub thread: bool,
    pub network: bool,
    pub frame: bool,
    pub available_signals: usize,
    /// Every signal with a non-zero weight was available.
    pub complete: bool,
    /// Groups dropped as stale; their signals count as unavailable.
    pub stale: StaleSignals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub health_score: f64,
    pub completeness: DataCompleteness,
    pub metrics: AggregateMetrics,
    /// Alerts raised during this tick.
    pub new_alerts: Vec<Alert>,
    pub timestamp_ms: u64,
}

/// Weighted composite score in [0, 100] over the available signals.
///
/// Each sub-score is clamped to [0, 100] first. With no weighted signal
/// available the score is 100 and the completeness is empty.
#[must_use]
pub fn compute_health_score(metrics: &AggregateMetrics, weights: &HealthWeights) -> (f64, DataCompleteness) {
    let signals = [
        (metrics.memory_usage_pct.map(|m| 100.0 - m), weights.memory),
        (metrics.cpu_usage_pct.map(|c| 100.0 - c), weights.cpu),
        (metrics.thread_health_score, weights.thread),
        (metrics.network_success_pct, weights.network),
        (metrics.frame_smoothness, weights.frame),
    ];

    let mut weighted = 0.0;
    let mut weight_used = 0.0;
    let mut complete = true;
    for (score, weight) in signals {
        match score.filter(|s| s.is_finite()) {
            Some(score) => {
                weighted += score.clamp(0.0, 100.0) * weight;
                weight_used += weight;
            }
            None if weight > 0.0 => complete = false,
            None => {}
        }
    }

    let present = [
        metrics.memory_usage_pct,
        metrics.cpu_usage_pct,
        metrics.thread_health_score,
        metrics.network_success_pct,
        metrics.frame_smoothness,
    ]
    .map(|signal| signal.is_some_and(f64::is_finite));
    let completeness = DataCompleteness {
        memory: present[0],
        cpu: present[1],
        thread: present[2],
        network: present[3],
        frame: present[4],
        available_signals: present.iter().filter(|&&p| p).count(),
        complete,
        stale: StaleSignals::default(),
    };
    let score = if weight_used > 0.0 {
        (weighted / weight_used).clamp(0.0, 100.0)
    } else {
        100.0
    };
    (score, completeness)
}

// =============================================================================
// Aggregator
// =============================================================================

pub struct AnomalyAggregator {
    config: RwLock<AggregatorConfig>,
    alerts: Mutex<VecDeque<Alert>>,
    last_published_score: Mutex<Option<f64>>,
    latest: RwLock<Option<HealthReport>>,
    findings: Mutex<FindingSubscription>,
    clock: SharedClock,
    bus: FindingBus,
}

impl AnomalyAggregator {
    #[must_use]
    pub fn new(config: AggregatorConfig, clock: SharedClock, bus: FindingBus) -> Self {
        let findings = bus.subscribe_to([
            FindingKind::LeakFound,
            FindingKind::CycleFound,
            FindingKind::DeadlockSuspected,
            FindingKind::Hitch,
            FindingKind::MainThreadBlocked,
        ]);
        Self {
            config: RwLock::new(config),
            alerts: Mutex::new(VecDeque::new()),
            last_published_score: Mutex::new(None),
            latest: RwLock::new(None),
            findings: Mutex::new(findings),
            clock,
            bus,
        }
    }

    /// One aggregation pass over `metrics` plus findings since the last tick.
    ///
    /// Stale signal groups are dropped before scoring, so they neither count
    /// toward the score nor raise threshold alerts.
    pub fn tick(&self, mut metrics: AggregateMetrics) -> HealthReport {
        let config = self.config.read().clone();
        let timestamp_ms = self.clock.epoch_ms();
        let stale = metrics.drop_stale(timestamp_ms, config.stale_after_ms);
        if stale.any() {
            debug!(
                subsystem = "aggregator",
                counters = stale.counters,
                threads = stale.threads,
                frames = stale.frames,
                "Stale signals dropped"
            );
        }
        let (health_score, mut completeness) = compute_health_score(&metrics, &config.weights);
        completeness.stale = stale;

        let mut new_alerts = self.ingest_findings();
        new_alerts.extend(self.check_for_alerts(&metrics));

        let previous = {
            let mut last = self.last_published_score.lock();
            let previous = *last;
            let moved = previous.is_none_or(|p| (health_score - p).abs() >= config.health_change_epsilon);
            if moved {
                *last = Some(health_score);
            }
            moved.then_some(previous)
        };
        if let Some(previous) = previous {
            info!(
                subsystem = "aggregator",
                previous = ?previous,
                current = health_score,
                complete = completeness.complete,
                "Health score changed"
            );
            self.bus.publish(Finding::HealthScoreChanged {
                previous,
                current: health_score,
                timestamp_ms,
            });
        }

        let report = HealthReport {
            health_score,
            completeness,
            metrics,
            new_alerts,
            timestamp_ms,
        };
        debug!(
            subsystem = "aggregator",
            score = report.health_score,
            signals = completeness.available_signals,
            alerts = report.new_alerts.len(),
            "Aggregation tick"
        );
        *self.latest.write() = Some(report.clone());
        report
    }

    /// Raise threshold alerts for `metrics`; returns the ones not deduplicated.
    pub fn check_for_alerts(&self, metrics: &AggregateMetrics) -> Vec<Alert> {
        let thresholds = self.config.read().thresholds.clone();
        let mut raised = Vec::new();

        if let Some(memory) = metrics.memory_usage_pct {
            if memory > thresholds.memory_critical_pct {
                raised.extend(self.raise(
                    AlertKind::MemoryCritical,
                    AlertSeverity::Critical,
                    format!("memory usage at {memory:.1}%"),
                ));
            } else if memory > thresholds.memory_warning_pct {
                raised.extend(self.raise(
                    AlertKind::MemoryWarning,
                    AlertSeverity::Warning,
                    format!("memory usage at {memory:.1}%"),
                ));
            }
        }
        if let Some(cpu) = metrics.cpu_usage_pct {
            if cpu > thresholds.cpu_critical_pct {
                raised.extend(self.raise(
                    AlertKind::CpuCritical,
                    AlertSeverity::Critical,
                    format!("CPU usage at {cpu:.1}%"),
                ));
            } else if cpu > thresholds.cpu_warning_pct {
                raised.extend(self.raise(
                    AlertKind::CpuWarning,
                    AlertSeverity::Warning,
                    format!("CPU usage at {cpu:.1}%"),
                ));
            }
        }
        if let Some(fps) = metrics.fps {
            if fps < thresholds.fps_critical {
                raised.extend(self.raise(
                    AlertKind::CriticalFps,
                    AlertSeverity::Critical,
                    format!("frame rate at {fps:.1} FPS"),
                ));
            } else if fps < thresholds.fps_warning {
                raised.extend(self.raise(
                    AlertKind::LowFps,
                    AlertSeverity::Warning,
                    format!("frame rate at {fps:.1} FPS"),
                ));
            }
        }
        raised
    }

    /// Turn findings published since the last call into alerts.
    pub fn ingest_findings(&self) -> Vec<Alert> {
        let findings = self.findings.lock().drain();
        findings
            .iter()
            .filter_map(alert_for_finding)
            .filter_map(|(kind, severity, message)| self.raise(kind, severity, message))
            .collect()
    }

    /// Record an alert unless the same kind was raised inside the dedup window.
    pub fn raise(&self, kind: AlertKind, severity: AlertSeverity, message: String) -> Option<Alert> {
        let (dedup_window_ms, max_alerts) = {
            let config = self.config.read();
            (config.dedup_window_ms, config.max_alerts)
        };
        let now_ms = self.clock.epoch_ms();
        let alert = {
            let mut alerts = self.alerts.lock();
            let duplicate = alerts
                .iter()
                .rev()
                .any(|a| a.kind == kind && now_ms.saturating_sub(a.timestamp_ms) < dedup_window_ms);
            if duplicate {
                return None;
            }
            let alert = Alert {
                kind,
                severity,
                message,
                timestamp_ms: now_ms,
            };
            alerts.push_back(alert.clone());
            while alerts.len() > max_alerts {
                alerts.pop_front();
            }
            alert
        };

        warn!(
            subsystem = "aggregator",
            kind = %alert.kind,
            severity = %alert.severity,
            message = %alert.message,
            "Alert raised"
        );
        self.bus.publish(Finding::Alert(alert.clone()));
        Some(alert)
    }

    /// Alert history, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn latest_report(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }

    /// Forget alerts, the last report, and any findings not yet ingested.
    pub fn clear(&self) {
        self.alerts.lock().clear();
        *self.last_published_score.lock() = None;
        *self.latest.write() = None;
        let _ = self.findings.lock().drain();
    }

    #[must_use]
    pub fn config(&self) -> AggregatorConfig {
        self.config.read().clone()
    }

    /// Replace weights and thresholds; a smaller `max_alerts` trims now.
    pub fn configure(&self, config: AggregatorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let max_alerts = config.max_alerts;
        *self.config.write() = config;
        let mut alerts = self.alerts.lock();
        while alerts.len() > max_alerts {
            alerts.pop_front();
        }
        Ok(())
    }
}

impl std::fmt::Debug for AnomalyAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyAggregator")
            .field("alerts", &self.alerts.lock().len())
            .finish_non_exhaustive()
    }
}

fn alert_for_finding(finding: &Finding) -> Option<(AlertKind, AlertSeverity, String)> {
    match finding {
        Finding::LeakFound(leak) => {
            let severity = match leak.severity {
                LeakSeverity::Low => return None,
                LeakSeverity::Medium => AlertSeverity::Info,
                LeakSeverity::High => AlertSeverity::Warning,
                LeakSeverity::Critical => AlertSeverity::Critical,
            };
            Some((
                AlertKind::LeakSuspected,
                severity,
                format!(
                    "{} ({}) alive for {}s",
                    leak.identifier,
                    leak.class_name,
                    leak.age_ms / 1000
                ),
            ))
        }
        Finding::CycleFound(cycle) => Some((
            AlertKind::ReferenceCycle,
            AlertSeverity::Warning,
            format!("reference cycle: {}", cycle.describe()),
        )),
        Finding::DeadlockSuspected(deadlock) => Some((
            AlertKind::DeadlockSuspected,
            AlertSeverity::Critical,
            deadlock.description.clone(),
        )),
        Finding::MainThreadBlocked(block) => Some((
            AlertKind::MainThreadBlocked,
            if block.timed_out {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            },
            format!("primary thread blocked for {:.1}ms", block.duration_ms),
        )),
        Finding::Hitch(hitch) if hitch.severity == HitchSeverity::Severe => Some((
            AlertKind::SevereHitch,
            AlertSeverity::Warning,
            format!("{:.1}ms frame hitch", hitch.duration_ms),
        )),
        Finding::Hitch(_) | Finding::HealthScoreChanged { .. } | Finding::Alert(_) => None,
    }
}
