//! Primary-thread responsiveness watchdog.
//!
//! A background task pings the primary execution context (UI thread, main
//! event loop) through a [`PrimaryContextPinger`] and times the answer.
//! Latency above the threshold, or no answer at all, is a block event.
//!
//! Hosts with a poll-style main loop can use [`primary_loop_channel`]: the
//! loop calls [`PrimaryLoopResponder::drain`] once per iteration and the
//! watchdog holds the matching [`PrimaryLoopPinger`].
//!
//! ```text
//! watchdog task ── ping ──► request channel ──► main loop drain()
//!       ▲                                              │
//!       └──────────────── reply channel ◄──────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{ensure_capacity, ensure_fixed_capacity, ensure_positive, ensure_positive_ms};
use crate::error::ConfigError;
use crate::events::{Finding, FindingBus};
use crate::host::{PingOutcome, PrimaryContextPinger};
use crate::ring_buffer::SampleRingBuffer;

/// Outstanding pings the channel queues before treating the loop as stuck.
const PING_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    /// Ping latency above this is a block. One 60 Hz frame by default.
    pub block_threshold_ms: f64,
    /// How long one ping may wait before counting as a timeout.
    pub ping_timeout_ms: u64,
    pub history_capacity: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1000,
            block_threshold_ms: 16.67,
            ping_timeout_ms: 2000,
            history_capacity: 100,
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive_ms("watchdog.check_interval_ms", self.check_interval_ms)?;
        ensure_positive("watchdog.block_threshold_ms", self.block_threshold_ms)?;
        ensure_positive_ms("watchdog.ping_timeout_ms", self.ping_timeout_ms)?;
        ensure_capacity("watchdog.history_capacity", self.history_capacity)?;
        if (self.ping_timeout_ms as f64) < self.block_threshold_ms {
            return Err(ConfigError::invalid(
                "watchdog.ping_timeout_ms must be >= watchdog.block_threshold_ms",
            ));
        }
        Ok(())
    }
}

/// The primary context answered late or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainThreadBlockEvent {
    /// Measured latency; the ping timeout when `timed_out`.
    pub duration_ms: f64,
    pub threshold_ms: f64,
    pub timed_out: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchdogReport {
    pub total_checks: u64,
    pub total_blocks: u64,
    pub total_timeouts: u64,
    /// Pings skipped because the primary context was not reachable.
    pub unavailable: u64,
    pub last_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub recent_events: Vec<MainThreadBlockEvent>,
}

#[derive(Debug, Default)]
struct WatchdogStats {
    checks: u64,
    blocks: u64,
    timeouts: u64,
    unavailable: u64,
    last_latency_ms: Option<f64>,
    max_latency_ms: Option<f64>,
}

pub struct PrimaryThreadWatchdog {
    config: RwLock<WatchdogConfig>,
    pinger: Option<Arc<dyn PrimaryContextPinger>>,
    events: SampleRingBuffer<MainThreadBlockEvent>,
    stats: Mutex<WatchdogStats>,
    clock: SharedClock,
    bus: FindingBus,
}

impl PrimaryThreadWatchdog {
    #[must_use]
    pub fn new(
        config: WatchdogConfig,
        pinger: Option<Arc<dyn PrimaryContextPinger>>,
        clock: SharedClock,
        bus: FindingBus,
    ) -> Self {
        let events = SampleRingBuffer::new(config.history_capacity.max(1));
        Self {
            config: RwLock::new(config),
            pinger,
            events,
            stats: Mutex::new(WatchdogStats::default()),
            clock,
            bus,
        }
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.pinger.is_some()
    }

    /// Ping once and classify the result.
    ///
    /// Blocks the calling thread for up to `ping_timeout_ms`; the engine
    /// runs this on the blocking pool.
    pub fn check(&self) -> Option<MainThreadBlockEvent> {
        let pinger = self.pinger.as_ref()?;
        let config = self.config.read().clone();
        let outcome = pinger.ping(Duration::from_millis(config.ping_timeout_ms));

        let (latency_ms, timed_out) = match outcome {
            PingOutcome::Responded(latency) => (latency.as_secs_f64() * 1000.0, false),
            PingOutcome::TimedOut => (config.ping_timeout_ms as f64, true),
            PingOutcome::Unavailable => {
                self.stats.lock().unavailable += 1;
                debug!(subsystem = "watchdog", "Primary context unavailable; ping skipped");
                return None;
            }
        };
        let blocked = timed_out || latency_ms > config.block_threshold_ms;

        {
            let mut stats = self.stats.lock();
            stats.checks += 1;
            stats.last_latency_ms = Some(latency_ms);
            stats.max_latency_ms = Some(stats.max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));
            if blocked {
                stats.blocks += 1;
            }
            if timed_out {
                stats.timeouts += 1;
            }
        }
        if !blocked {
            return None;
        }

        let event = MainThreadBlockEvent {
            duration_ms: latency_ms,
            threshold_ms: config.block_threshold_ms,
            timed_out,
            timestamp_ms: self.clock.epoch_ms(),
        };
        warn!(
            subsystem = "watchdog",
            duration_ms = event.duration_ms,
            threshold_ms = event.threshold_ms,
            timed_out,
            "Primary thread blocked"
        );
        self.events.push(event.clone());
        self.bus.publish(Finding::MainThreadBlocked(event.clone()));
        Some(event)
    }

    #[must_use]
    pub fn report(&self) -> WatchdogReport {
        let stats = self.stats.lock();
        WatchdogReport {
            total_checks: stats.checks,
            total_blocks: stats.blocks,
            total_timeouts: stats.timeouts,
            unavailable: stats.unavailable,
            last_latency_ms: stats.last_latency_ms,
            max_latency_ms: stats.max_latency_ms,
            recent_events: self.events.snapshot(),
        }
    }

    #[must_use]
    pub fn recent_events(&self) -> Vec<MainThreadBlockEvent> {
        self.events.snapshot()
    }

    pub fn clear(&self) {
        self.events.clear();
        *self.stats.lock() = WatchdogStats::default();
    }

    #[must_use]
    pub fn config(&self) -> WatchdogConfig {
        self.config.read().clone()
    }

    /// Validate `config` as a replacement for the current one.
    pub fn check_update(&self, config: &WatchdogConfig) -> Result<(), ConfigError> {
        config.validate()?;
        ensure_fixed_capacity(
            "watchdog.history_capacity",
            self.events.capacity(),
            config.history_capacity,
        )
    }

    /// Replace thresholds. `history_capacity` must stay as constructed.
    pub fn configure(&self, config: WatchdogConfig) -> Result<(), ConfigError> {
        self.check_update(&config)?;
        *self.config.write() = config;
        Ok(())
    }
}

impl std::fmt::Debug for PrimaryThreadWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryThreadWatchdog")
            .field("supported", &self.is_supported())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Ping channel for poll-style main loops
// =============================================================================

/// Create a connected pinger/responder pair.
#[must_use]
pub fn primary_loop_channel() -> (PrimaryLoopPinger, PrimaryLoopResponder) {
    let (requests, inbox) = channel::bounded(PING_QUEUE_DEPTH);
    (
        PrimaryLoopPinger { requests },
        PrimaryLoopResponder { inbox },
    )
}

/// Watchdog side of the ping channel.
#[derive(Debug, Clone)]
pub struct PrimaryLoopPinger {
    requests: Sender<Sender<()>>,
}

impl PrimaryContextPinger for PrimaryLoopPinger {
    fn ping(&self, timeout: Duration) -> PingOutcome {
        let (reply, answer) = channel::bounded(1);
        let sent_at = Instant::now();
        match self.requests.try_send(reply) {
            Ok(()) => {}
            // Earlier pings still unanswered: the loop is not draining.
            Err(TrySendError::Full(_)) => return PingOutcome::TimedOut,
            Err(TrySendError::Disconnected(_)) => return PingOutcome::Unavailable,
        }
        match answer.recv_timeout(timeout) {
            Ok(()) => PingOutcome::Responded(sent_at.elapsed()),
            Err(RecvTimeoutError::Timeout) => PingOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => PingOutcome::Unavailable,
        }
    }
}

/// Primary-loop side of the ping channel.
#[derive(Debug)]
pub struct PrimaryLoopResponder {
    inbox: Receiver<Sender<()>>,
}

impl PrimaryLoopResponder {
    /// Answer every queued ping. Call once per main-loop iteration.
    pub fn drain(&self) -> usize {
        self.inbox
            .try_iter()
            .map(|reply| {
                // The pinger may have timed out and dropped its end.
                let _ = reply.send(());
            })
            .count()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}
