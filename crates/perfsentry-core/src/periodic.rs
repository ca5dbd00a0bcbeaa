//! Cancellable periodic tasks.
//!
//! Every sampler in the engine runs as one of these instead of an ambient
//! platform timer. The task ticks on `tokio::time::interval`, so tests can
//! drive it with paused tokio time.
//!
//! ```text
//! Engine::start()
//!   ├── spawn_periodic("threads", 500ms, sample)      ──► SampleRingBuffer
//!   ├── spawn_periodic("frames", 1s, report)          ──► SampleRingBuffer
//!   ├── spawn_periodic_blocking("watchdog", 1s, ping) ──► SampleRingBuffer
//!   └── spawn_periodic("aggregator", 5s, tick)        ──► FindingBus
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{Error, Result};

type Job = Arc<dyn Fn() + Send + Sync>;

/// Handle to a running periodic task.
///
/// Dropping the handle signals shutdown but does not wait; use
/// [`stop`](Self::stop) when the caller needs the guarantee that no further
/// job runs.
pub struct PeriodicHandle {
    name: String,
    task: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    ticks: Arc<AtomicU64>,
}

impl PeriodicHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed job runs.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Whether the task is still looping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the task to exit at its next wake-up without waiting for it.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Stop the task and wait for it; no job runs after this returns.
    pub async fn stop(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(task = %self.name, error = %err, "Periodic task ended abnormally");
            }
        }
        debug!(task = %self.name, ticks = self.ticks(), "Periodic task stopped");
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("name", &self.name)
            .field("ticks", &self.ticks())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run `job` every `interval` on the current tokio runtime.
///
/// The first run happens immediately. `job` must be short and non-blocking;
/// use [`spawn_periodic_blocking`] for jobs that wait on something.
pub fn spawn_periodic<F>(name: impl Into<String>, interval: Duration, job: F) -> Result<PeriodicHandle>
where
    F: Fn() + Send + Sync + 'static,
{
    spawn(name.into(), interval, Arc::new(job), false)
}

/// Like [`spawn_periodic`], but each run goes through `spawn_blocking`
/// so a timed wait inside `job` never stalls a runtime worker.
pub fn spawn_periodic_blocking<F>(
    name: impl Into<String>,
    interval: Duration,
    job: F,
) -> Result<PeriodicHandle>
where
    F: Fn() + Send + Sync + 'static,
{
    spawn(name.into(), interval, Arc::new(job), true)
}

fn spawn(name: String, interval: Duration, job: Job, blocking: bool) -> Result<PeriodicHandle> {
    if interval.is_zero() {
        return Err(Error::Runtime(format!("periodic task {name}: interval must be > 0")));
    }
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::Runtime(format!("periodic task {name}: {e}")))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let ticks = Arc::new(AtomicU64::new(0));

    let task = {
        let shutdown = Arc::clone(&shutdown);
        let wake = Arc::clone(&wake);
        let ticks = Arc::clone(&ticks);
        let name = name.clone();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(task = %name, interval_ms = interval.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = wake.notified() => {}
                }
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                if blocking {
                    let job = Arc::clone(&job);
                    if let Err(err) = tokio::task::spawn_blocking(move || job()).await {
                        warn!(task = %name, error = %err, "Blocking periodic job panicked");
                    }
                } else {
                    job();
                }
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    Ok(PeriodicHandle {
        name,
        task: Some(task),
        shutdown,
        wake,
        ticks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_without_runtime_fails() {
        let err = spawn_periodic("orphan", Duration::from_millis(10), || {}).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[tokio::test]
    async fn zero_interval_rejected() {
        let err = spawn_periodic("zero", Duration::ZERO, || {}).unwrap_err();
        assert!(err.to_string().contains("interval must be > 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_schedule() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("counter", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_runs_after_stop() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("stopper", Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_job_runs_off_worker() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic_blocking("blocking", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.stop().await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
