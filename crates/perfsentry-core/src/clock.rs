//! Injectable time source.
//!
//! Every age, interval and timestamp in the engine is read through a
//! [`Clock`], so the same code runs against wall time in production and a
//! hand-advanced [`ManualClock`] in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic time since the clock's origin.
    fn now(&self) -> Duration;

    /// Wall-clock time in epoch milliseconds, used for report timestamps.
    fn epoch_ms(&self) -> u64;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Real time: `Instant` for ages, `SystemTime` for timestamps.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn epoch_ms(&self) -> u64 {
        epoch_ms()
    }
}

/// Virtual clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    offset_nanos: AtomicU64,
    base_epoch_ms: u64,
}

impl ManualClock {
    /// A clock at offset zero whose wall time starts at `base_epoch_ms`.
    #[must_use]
    pub fn new(base_epoch_ms: u64) -> Self {
        Self {
            offset_nanos: AtomicU64::new(0),
            base_epoch_ms,
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(duration_nanos(by), Ordering::SeqCst);
    }

    /// Jump to an absolute offset from the origin.
    ///
    /// Moving backwards is allowed; callers that need monotonicity should
    /// only use [`advance`](Self::advance).
    pub fn set(&self, offset: Duration) {
        self.offset_nanos
            .store(duration_nanos(offset), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }

    fn epoch_ms(&self) -> u64 {
        self.base_epoch_ms + self.now().as_millis() as u64
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Current wall time in epoch milliseconds (0 if the system clock is before 1970).
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}
