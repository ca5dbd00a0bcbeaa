//! Frame timing, hitch detection and jank analysis.
//!
//! The host feeds one timestamp per rendered frame, either directly through
//! [`FrameTimingSampler::record_frame`] or by attaching the sampler to a
//! [`FrameClock`]. Each interval lands in a sliding window; an interval over
//! the hitch threshold is classified and published immediately. A periodic
//! `sample` turns the intervals since the last sample into one
//! [`FrameSample`] for the long-term FPS history.
//!
//! All intervals are in milliseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{
    ensure_ascending, ensure_capacity, ensure_fixed_capacity, ensure_positive, ensure_positive_ms,
};
use crate::error::{ConfigError, HostError};
use crate::events::{Finding, FindingBus};
use crate::host::FrameClock;
use crate::ring_buffer::{RingBuffer, SampleRingBuffer};

/// Intervals buffered between two `sample` calls.
const PENDING_CAPACITY: usize = 4096;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub enabled: bool,
    pub target_fps: f64,
    /// A single interval above this is a hitch.
    pub hitch_threshold_ms: f64,
    /// Cadence of `sample` when driven by the engine.
    pub sample_interval_ms: u64,
    /// Intervals kept for jank analysis.
    pub window_size: usize,
    /// Newest intervals used for `current_fps`.
    pub current_window: usize,
    /// Per-sample FPS entries kept (3600 = one hour at 1 Hz).
    pub history_capacity: usize,
    pub hitch_history_capacity: usize,
    /// An interval above `factor x target interval` counts as a dropped frame.
    pub dropped_frame_factor: f64,
    /// Hitch severity steps: below `minor_below_ms` is minor, and so on.
    pub minor_below_ms: f64,
    pub moderate_below_ms: f64,
    pub major_below_ms: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_fps: 60.0,
            hitch_threshold_ms: 16.67,
            sample_interval_ms: 1000,
            window_size: 120,
            current_window: 10,
            history_capacity: 3600,
            hitch_history_capacity: 256,
            dropped_frame_factor: 1.5,
            minor_below_ms: 33.0,
            moderate_below_ms: 100.0,
            major_below_ms: 250.0,
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("frames.target_fps", self.target_fps)?;
        ensure_positive("frames.hitch_threshold_ms", self.hitch_threshold_ms)?;
        ensure_positive_ms("frames.sample_interval_ms", self.sample_interval_ms)?;
        ensure_capacity("frames.window_size", self.window_size)?;
        ensure_capacity("frames.current_window", self.current_window)?;
        ensure_capacity("frames.history_capacity", self.history_capacity)?;
        ensure_capacity("frames.hitch_history_capacity", self.hitch_history_capacity)?;
        ensure_positive("frames.dropped_frame_factor", self.dropped_frame_factor)?;
        ensure_ascending(
            "frames hitch severity steps",
            &[self.minor_below_ms, self.moderate_below_ms, self.major_below_ms],
        )
    }

    /// Map a hitch duration onto the severity steps.
    #[must_use]
    pub fn classify_hitch(&self, duration_ms: f64) -> HitchSeverity {
        if duration_ms < self.minor_below_ms {
            HitchSeverity::Minor
        } else if duration_ms < self.moderate_below_ms {
            HitchSeverity::Moderate
        } else if duration_ms < self.major_below_ms {
            HitchSeverity::Major
        } else {
            HitchSeverity::Severe
        }
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitchSeverity {
    Minor,
    Moderate,
    Major,
    Severe,
}

impl std::fmt::Display for HitchSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Moderate => write!(f, "moderate"),
            Self::Major => write!(f, "major"),
            Self::Severe => write!(f, "severe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitchEvent {
    pub duration_ms: f64,
    /// Target frame interval at the time of the hitch.
    pub expected_duration_ms: f64,
    pub severity: HitchSeverity,
    pub timestamp_ms: u64,
}

/// Frames observed between two consecutive `sample` calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    pub fps: f64,
    pub frame_count: usize,
    pub dropped_frames: usize,
    pub has_hitch: bool,
    pub timestamp_ms: u64,
}

/// Jank metrics over one window of intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JankStats {
    pub current_fps: f64,
    pub average_fps: f64,
    pub min_fps: f64,
    pub max_fps: f64,
    pub dropped_frames: usize,
    /// 100 for perfectly even pacing, falling with interval spread.
    pub jank_score: f64,
    /// Percentage of windowed frames that were dropped.
    pub jank_percentage: f64,
    pub smoothness_score: f64,
    pub p95_fps: Option<f64>,
    pub p99_fps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRateReport {
    /// `None` until at least one interval was recorded.
    pub stats: Option<JankStats>,
    pub target_fps: f64,
    pub total_frames: u64,
    pub hitch_count: u64,
    pub recent_hitches: Vec<HitchEvent>,
    pub timestamp_ms: u64,
}

// =============================================================================
// Jank analysis
// =============================================================================

/// Pure jank math over interval windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JankAnalyzer {
    target_fps: f64,
    dropped_frame_factor: f64,
}

impl JankAnalyzer {
    #[must_use]
    pub fn new(target_fps: f64, dropped_frame_factor: f64) -> Self {
        Self {
            target_fps,
            dropped_frame_factor,
        }
    }

    #[must_use]
    pub fn from_config(config: &FrameConfig) -> Self {
        Self::new(config.target_fps, config.dropped_frame_factor)
    }

    #[must_use]
    pub fn target_interval_ms(&self) -> f64 {
        1000.0 / self.target_fps
    }

    #[must_use]
    pub fn is_dropped(&self, interval_ms: f64) -> bool {
        interval_ms > self.dropped_frame_factor * self.target_interval_ms()
    }

    /// `100 - min(stddev / target_interval, 1) * 100`, in [0, 100].
    #[must_use]
    pub fn jank_score(&self, intervals_ms: &[f64]) -> f64 {
        if intervals_ms.len() < 2 {
            return 100.0;
        }
        let n = intervals_ms.len() as f64;
        let mean = intervals_ms.iter().sum::<f64>() / n;
        let variance = intervals_ms.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let spread = (variance.sqrt() / self.target_interval_ms()).min(1.0);
        (100.0 - spread * 100.0).clamp(0.0, 100.0)
    }

    /// Dropped frames over total frames, as a percentage.
    #[must_use]
    pub fn jank_percentage(&self, intervals_ms: &[f64]) -> f64 {
        if intervals_ms.is_empty() {
            return 0.0;
        }
        let dropped = intervals_ms.iter().filter(|&&i| self.is_dropped(i)).count();
        dropped as f64 / intervals_ms.len() as f64 * 100.0
    }

    /// `50 x min(avg / target, 1) + 50 x (1 - jank% / 100)`, in [0, 100].
    #[must_use]
    pub fn smoothness_score(&self, average_fps: f64, jank_percentage: f64) -> f64 {
        let pace = (average_fps / self.target_fps).clamp(0.0, 1.0);
        let even = 1.0 - (jank_percentage / 100.0).clamp(0.0, 1.0);
        50.0 * pace + 50.0 * even
    }

    /// Full metrics for a window of intervals; `None` for an empty window.
    #[must_use]
    pub fn analyze(&self, intervals_ms: &[f64], current_window: usize, fps_history: &[f64]) -> Option<JankStats> {
        if intervals_ms.is_empty() {
            return None;
        }
        let recent = &intervals_ms[intervals_ms.len().saturating_sub(current_window)..];
        let slowest = intervals_ms.iter().copied().fold(f64::MIN, f64::max);
        let fastest = intervals_ms.iter().copied().fold(f64::MAX, f64::min);
        let average_fps = fps_of(intervals_ms);
        let jank_percentage = self.jank_percentage(intervals_ms);

        let mut sorted = fps_history.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Some(JankStats {
            current_fps: fps_of(recent),
            average_fps,
            min_fps: 1000.0 / slowest,
            max_fps: 1000.0 / fastest,
            dropped_frames: intervals_ms.iter().filter(|&&i| self.is_dropped(i)).count(),
            jank_score: self.jank_score(intervals_ms),
            jank_percentage,
            smoothness_score: self.smoothness_score(average_fps, jank_percentage),
            p95_fps: percentile(&sorted, 0.95),
            p99_fps: percentile(&sorted, 0.99),
        })
    }
}

/// Frames per second implied by the mean of positive intervals.
fn fps_of(intervals_ms: &[f64]) -> f64 {
    if intervals_ms.is_empty() {
        return 0.0;
    }
    let mean = intervals_ms.iter().sum::<f64>() / intervals_ms.len() as f64;
    if mean > 0.0 { 1000.0 / mean } else { 0.0 }
}

/// Nearest-rank percentile over an ascending slice.
#[must_use]
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q.clamp(0.0, 1.0)) as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

// =============================================================================
// Sampler
// =============================================================================

/// One windowed interval and the wall time it was recorded.
#[derive(Debug, Clone, Copy)]
struct TimedInterval {
    interval_ms: f64,
    recorded_at_ms: u64,
}

struct FrameState {
    last_timestamp: Option<Duration>,
    pending: RingBuffer<f64>,
    pending_hitch: bool,
}

impl FrameState {
    fn new() -> Self {
        Self {
            last_timestamp: None,
            pending: RingBuffer::new(PENDING_CAPACITY),
            pending_hitch: false,
        }
    }
}

pub struct FrameTimingSampler {
    config: RwLock<FrameConfig>,
    state: Mutex<FrameState>,
    window: SampleRingBuffer<TimedInterval>,
    history: SampleRingBuffer<FrameSample>,
    hitches: SampleRingBuffer<HitchEvent>,
    total_frames: AtomicU64,
    total_hitches: AtomicU64,
    clock: SharedClock,
    bus: FindingBus,
}

impl FrameTimingSampler {
    #[must_use]
    pub fn new(config: FrameConfig, clock: SharedClock, bus: FindingBus) -> Self {
        Self {
            window: SampleRingBuffer::new(config.window_size.max(1)),
            history: SampleRingBuffer::new(config.history_capacity.max(1)),
            hitches: SampleRingBuffer::new(config.hitch_history_capacity.max(1)),
            config: RwLock::new(config),
            state: Mutex::new(FrameState::new()),
            total_frames: AtomicU64::new(0),
            total_hitches: AtomicU64::new(0),
            clock,
            bus,
        }
    }

    /// Register with a host frame clock. The callback holds a weak handle,
    /// so dropping the sampler silences it.
    pub fn attach(self: &Arc<Self>, frame_clock: &dyn FrameClock) -> Result<(), HostError> {
        let sampler: Weak<Self> = Arc::downgrade(self);
        frame_clock.on_tick(Box::new(move |timestamp| {
            if let Some(sampler) = sampler.upgrade() {
                sampler.record_frame(timestamp);
            }
        }))
    }

    /// Record a frame at `timestamp` on the host's monotonic frame clock.
    ///
    /// The first call only sets the baseline. Timestamps that do not move
    /// forward are ignored.
    pub fn record_frame(&self, timestamp: Duration) -> Option<HitchEvent> {
        let previous = {
            let mut state = self.state.lock();
            match state.last_timestamp {
                Some(previous) if timestamp <= previous => {
                    debug!(subsystem = "frames", "Non-increasing frame timestamp ignored");
                    return None;
                }
                previous => {
                    state.last_timestamp = Some(timestamp);
                    previous?
                }
            }
        };
        self.record_interval(timestamp - previous)
    }

    /// Record one frame interval directly.
    pub fn record_interval(&self, interval: Duration) -> Option<HitchEvent> {
        let interval_ms = interval.as_secs_f64() * 1000.0;
        if interval_ms <= 0.0 {
            return None;
        }
        let config = self.config.read().clone();
        let is_hitch = interval_ms > config.hitch_threshold_ms;
        let recorded_at_ms = self.clock.epoch_ms();

        self.window.push(TimedInterval {
            interval_ms,
            recorded_at_ms,
        });
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.pending.push(interval_ms);
            state.pending_hitch |= is_hitch;
        }
        if !is_hitch {
            return None;
        }

        let event = HitchEvent {
            duration_ms: interval_ms,
            expected_duration_ms: 1000.0 / config.target_fps,
            severity: config.classify_hitch(interval_ms),
            timestamp_ms: recorded_at_ms,
        };
        self.total_hitches.fetch_add(1, Ordering::Relaxed);
        self.hitches.push(event.clone());
        if event.severity >= HitchSeverity::Major {
            warn!(
                subsystem = "frames",
                duration_ms = event.duration_ms,
                severity = %event.severity,
                "Frame hitch"
            );
        } else {
            debug!(
                subsystem = "frames",
                duration_ms = event.duration_ms,
                severity = %event.severity,
                "Frame hitch"
            );
        }
        self.bus.publish(Finding::Hitch(event.clone()));
        Some(event)
    }

    /// Fold frames since the previous call into one FPS history entry.
    ///
    /// Returns `None` when no frame was rendered in between.
    pub fn sample(&self) -> Option<FrameSample> {
        let (intervals, has_hitch) = {
            let mut state = self.state.lock();
            let intervals = state.pending.to_owned_vec();
            state.pending.clear();
            (intervals, std::mem::take(&mut state.pending_hitch))
        };
        if intervals.is_empty() {
            return None;
        }
        let analyzer = JankAnalyzer::from_config(&self.config.read());
        let sample = FrameSample {
            fps: fps_of(&intervals),
            frame_count: intervals.len(),
            dropped_frames: intervals.iter().filter(|&&i| analyzer.is_dropped(i)).count(),
            has_hitch,
            timestamp_ms: self.clock.epoch_ms(),
        };
        self.history.push(sample.clone());
        debug!(
            subsystem = "frames",
            fps = sample.fps,
            frames = sample.frame_count,
            dropped = sample.dropped_frames,
            "Frame sample"
        );
        Some(sample)
    }

    /// Current jank metrics over the sliding window.
    #[must_use]
    pub fn report(&self) -> FrameRateReport {
        let config = self.config.read().clone();
        FrameRateReport {
            stats: self.analyze_window(&config, None),
            target_fps: config.target_fps,
            total_frames: self.total_frames.load(Ordering::Relaxed),
            hitch_count: self.total_hitches.load(Ordering::Relaxed),
            recent_hitches: self.hitches.last_n(10),
            timestamp_ms: self.clock.epoch_ms(),
        }
    }

    /// Jank metrics over windowed intervals recorded in the last
    /// `max_age_ms`; `None` when no frame was rendered in that span.
    #[must_use]
    pub fn stats_within(&self, max_age_ms: u64) -> Option<JankStats> {
        let config = self.config.read().clone();
        let since_ms = self.clock.epoch_ms().saturating_sub(max_age_ms);
        self.analyze_window(&config, Some(since_ms))
    }

    /// Wall time of the newest windowed interval.
    #[must_use]
    pub fn last_frame_ms(&self) -> Option<u64> {
        self.window.latest().map(|i| i.recorded_at_ms)
    }

    fn analyze_window(&self, config: &FrameConfig, since_ms: Option<u64>) -> Option<JankStats> {
        let since_ms = since_ms.unwrap_or(0);
        let intervals: Vec<f64> = self.window.with(|w| {
            w.iter()
                .filter(|i| i.recorded_at_ms >= since_ms)
                .map(|i| i.interval_ms)
                .collect()
        });
        let fps_history: Vec<f64> = self.history.with(|h| {
            h.iter()
                .filter(|s| s.timestamp_ms >= since_ms)
                .map(|s| s.fps)
                .collect()
        });
        JankAnalyzer::from_config(config).analyze(&intervals, config.current_window, &fps_history)
    }

    #[must_use]
    pub fn history(&self) -> Vec<FrameSample> {
        self.history.snapshot()
    }

    #[must_use]
    pub fn recent_hitches(&self) -> Vec<HitchEvent> {
        self.hitches.snapshot()
    }

    /// Drop all buffered timing data, including the frame baseline.
    pub fn clear(&self) {
        *self.state.lock() = FrameState::new();
        self.window.clear();
        self.history.clear();
        self.hitches.clear();
        self.total_frames.store(0, Ordering::Relaxed);
        self.total_hitches.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn config(&self) -> FrameConfig {
        self.config.read().clone()
    }

    /// Validate `config` as a replacement for the current one.
    pub fn check_update(&self, config: &FrameConfig) -> Result<(), ConfigError> {
        config.validate()?;
        ensure_fixed_capacity("frames.window_size", self.window.capacity(), config.window_size)?;
        ensure_fixed_capacity(
            "frames.history_capacity",
            self.history.capacity(),
            config.history_capacity,
        )?;
        ensure_fixed_capacity(
            "frames.hitch_history_capacity",
            self.hitches.capacity(),
            config.hitch_history_capacity,
        )
    }

    /// Replace thresholds. Buffer capacities must stay as constructed.
    pub fn configure(&self, config: FrameConfig) -> Result<(), ConfigError> {
        self.check_update(&config)?;
        *self.config.write() = config;
        Ok(())
    }
}

impl std::fmt::Debug for FrameTimingSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTimingSampler")
            .field("total_frames", &self.total_frames.load(Ordering::Relaxed))
            .field("total_hitches", &self.total_hitches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::FindingKind;
    use crate::host::FrameCallback;

    const FRAME_60: Duration = Duration::from_micros(16_667);

    fn sampler(bus: &FindingBus) -> FrameTimingSampler {
        FrameTimingSampler::new(
            FrameConfig::default(),
            Arc::new(ManualClock::default()),
            bus.clone(),
        )
    }

    fn feed(sampler: &FrameTimingSampler, intervals: &[Duration]) {
        let mut at = Duration::from_secs(1);
        sampler.record_frame(at);
        for interval in intervals {
            at += *interval;
            sampler.record_frame(at);
        }
    }

    #[test]
    fn steady_60fps_is_smooth() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        feed(&sampler, &[FRAME_60; 120]);

        let stats = sampler.report().stats.unwrap();
        assert!((stats.current_fps - 60.0).abs() < 0.1);
        assert!(stats.jank_score > 99.0);
        assert!(stats.jank_percentage.abs() < f64::EPSILON);
        assert!(stats.smoothness_score > 99.0);
        assert_eq!(sampler.report().hitch_count, 0);
    }

    #[test]
    fn hitches_classified_by_duration() {
        let config = FrameConfig::default();
        assert_eq!(config.classify_hitch(20.0), HitchSeverity::Minor);
        assert_eq!(config.classify_hitch(50.0), HitchSeverity::Moderate);
        assert_eq!(config.classify_hitch(150.0), HitchSeverity::Major);
        assert_eq!(config.classify_hitch(300.0), HitchSeverity::Severe);
    }

    #[test]
    fn hitch_published_immediately() {
        let bus = FindingBus::new(8);
        let mut sub = bus.subscribe_to([FindingKind::Hitch]);
        let sampler = sampler(&bus);
        feed(&sampler, &[FRAME_60, Duration::from_millis(50), FRAME_60]);

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        match &published[0] {
            Finding::Hitch(h) => assert_eq!(h.severity, HitchSeverity::Moderate),
            other => panic!("unexpected finding {other:?}"),
        }
        assert_eq!(sampler.recent_hitches().len(), 1);
    }

    #[test]
    fn first_frame_only_sets_baseline() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        assert!(sampler.record_frame(Duration::from_secs(5)).is_none());
        assert!(sampler.report().stats.is_none());
        assert!(sampler.record_frame(Duration::from_secs(4)).is_none());
        assert_eq!(sampler.report().total_frames, 0);
    }

    #[test]
    fn sample_drains_pending_frames() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        feed(&sampler, &[FRAME_60, FRAME_60, Duration::from_millis(40)]);

        let sample = sampler.sample().unwrap();
        assert_eq!(sample.frame_count, 3);
        assert_eq!(sample.dropped_frames, 1);
        assert!(sample.has_hitch);
        assert!(sampler.sample().is_none());
        assert_eq!(sampler.history().len(), 1);
    }

    #[test]
    fn smoothness_formula() {
        let analyzer = JankAnalyzer::new(60.0, 1.5);
        assert!((analyzer.smoothness_score(30.0, 50.0) - 50.0).abs() < 1e-9);
        assert!((analyzer.smoothness_score(120.0, 0.0) - 100.0).abs() < 1e-9);
        assert!(analyzer.smoothness_score(0.0, 100.0).abs() < 1e-9);
    }

    #[test]
    fn uneven_pacing_lowers_jank_score() {
        let analyzer = JankAnalyzer::new(60.0, 1.5);
        let even = [16.67; 10];
        let uneven = [8.0, 40.0, 8.0, 40.0, 8.0, 40.0];
        assert!(analyzer.jank_score(&even) > analyzer.jank_score(&uneven));
        assert!(analyzer.jank_score(&[5.0, 500.0]).abs() < f64::EPSILON);
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.95), Some(95.0));
        assert_eq!(percentile(&sorted, 0.99), Some(99.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn window_is_bounded() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        feed(&sampler, &[FRAME_60; 500]);
        assert_eq!(sampler.report().total_frames, 500);
        assert_eq!(sampler.window.len(), 120);
    }

    /// Frame clock that stores its callback for manual ticking.
    #[derive(Default)]
    struct ManualFrameClock(Mutex<Option<FrameCallback>>);

    impl FrameClock for ManualFrameClock {
        fn on_tick(&self, callback: FrameCallback) -> Result<(), HostError> {
            *self.0.lock() = Some(callback);
            Ok(())
        }
    }

    impl ManualFrameClock {
        fn tick(&self, at: Duration) {
            if let Some(callback) = self.0.lock().as_ref() {
                callback(at);
            }
        }
    }

    #[test]
    fn attach_routes_ticks() {
        let bus = FindingBus::default();
        let sampler = Arc::new(sampler(&bus));
        let clock = ManualFrameClock::default();
        sampler.attach(&clock).unwrap();

        clock.tick(Duration::from_millis(0));
        clock.tick(Duration::from_millis(17));
        clock.tick(Duration::from_millis(34));
        assert_eq!(sampler.report().total_frames, 2);

        drop(sampler);
        clock.tick(Duration::from_millis(51));
    }

    #[test]
    fn stats_within_ignores_old_intervals() {
        let clock = Arc::new(ManualClock::new(0));
        let sampler = FrameTimingSampler::new(FrameConfig::default(), clock.clone(), FindingBus::default());
        for _ in 0..10 {
            sampler.record_interval(Duration::from_millis(100));
        }
        assert_eq!(sampler.last_frame_ms(), Some(0));
        let fresh = sampler.stats_within(30_000).unwrap();
        assert!((fresh.current_fps - 10.0).abs() < 1e-9);

        clock.advance(Duration::from_secs(60));
        assert!(sampler.stats_within(30_000).is_none());
        // The full-window report still shows the last frames seen.
        assert!(sampler.report().stats.is_some());

        for _ in 0..5 {
            sampler.record_interval(FRAME_60);
        }
        let mixed = sampler.stats_within(30_000).unwrap();
        assert!((mixed.average_fps - 60.0).abs() < 0.1);
    }

    #[test]
    fn configure_rejects_capacity_change() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        let resized = FrameConfig {
            history_capacity: 60,
            target_fps: 120.0,
            ..FrameConfig::default()
        };
        let err = sampler.configure(resized).unwrap_err();
        assert!(err.to_string().contains("frames.history_capacity is fixed"));
        assert!((sampler.config().target_fps - 60.0).abs() < f64::EPSILON);

        let retargeted = FrameConfig {
            target_fps: 120.0,
            ..FrameConfig::default()
        };
        sampler.configure(retargeted).unwrap();
        assert!((sampler.config().target_fps - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_resets_baseline() {
        let bus = FindingBus::default();
        let sampler = sampler(&bus);
        feed(&sampler, &[FRAME_60; 5]);
        sampler.clear();
        assert_eq!(sampler.report().total_frames, 0);
        assert!(sampler.record_frame(Duration::from_secs(100)).is_none());
        assert_eq!(sampler.report().total_frames, 0);
    }
}
