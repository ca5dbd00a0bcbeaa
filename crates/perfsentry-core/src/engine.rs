//! The engine handle: owns every subsystem and their periodic tasks.
//!
//! ```text
//!                 ┌──────────── Engine ─────────────┐
//!   host ────────►│ tracker  graph  threads         │
//!   capabilities  │ watchdog frames                 │──► FindingBus ──► subscribers
//!                 │        └──────► aggregator ◄────│
//!                 └─────────────────────────────────┘
//! ```
//!
//! Nothing here is global. Create an [`Engine`], hand it the host
//! capabilities the platform offers, and call [`Engine::start`] inside a
//! tokio runtime. Subsystems whose capability is missing stay idle and
//! report themselves unsupported.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::aggregator::{AggregateMetrics, Alert, AnomalyAggregator, HealthReport, SampleTimes};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{FindingBus, FindingKind, FindingSubscription};
use crate::frames::FrameTimingSampler;
use crate::graph::{CycleScan, ObjectRef, ReferenceGraphWalker};
use crate::host::{FrameClock, HostCapabilities, HostCounterSample};
use crate::lifecycle::ObjectLifecycleTracker;
use crate::periodic::{PeriodicHandle, spawn_periodic, spawn_periodic_blocking};
use crate::report::{EngineReport, FrameSection, LeakSection, SupportMatrix, ThreadSection};
use crate::threads::ThreadSnapshotSampler;
use crate::watchdog::PrimaryThreadWatchdog;

struct Subsystems {
    host: HostCapabilities,
    tracker: ObjectLifecycleTracker,
    graph: ReferenceGraphWalker,
    threads: ThreadSnapshotSampler,
    watchdog: PrimaryThreadWatchdog,
    frames: Arc<FrameTimingSampler>,
    aggregator: AnomalyAggregator,
    clock: SharedClock,
}

impl Subsystems {
    /// Latest output of every subsystem, stamped with when it was sampled.
    ///
    /// Frame metrics only cover intervals recorded within the staleness
    /// limit; the aggregator drops any other group that has aged past it.
    fn collect_metrics(&self) -> AggregateMetrics {
        let stale_after_ms = self.aggregator.config().stale_after_ms;
        let (counters, counters_ms) = match self.host.counters.as_ref().map(|c| c.sample()) {
            Some(Ok(sample)) => (sample, Some(self.clock.epoch_ms())),
            Some(Err(err)) => {
                warn!(subsystem = "aggregator", error = %err, "Host counter sample failed");
                (HostCounterSample::default(), None)
            }
            None => (HostCounterSample::default(), None),
        };
        let thread_report = self.threads.latest_report();
        let frame_stats = self.frames.stats_within(stale_after_ms);
        AggregateMetrics {
            memory_usage_pct: counters.memory_usage_pct(),
            cpu_usage_pct: counters.cpu_usage_pct,
            disk_usage_pct: counters.disk_usage_pct,
            network_success_pct: counters.network_success_pct,
            thread_health_score: thread_report.as_ref().map(|r| r.score),
            fps: frame_stats.as_ref().map(|s| s.current_fps),
            frame_smoothness: frame_stats.as_ref().map(|s| s.smoothness_score),
            potential_leaks: self.tracker.statistics().potential_leaks,
            deadlock_suspected: self.threads.latest_deadlock().is_some(),
            sampled_at: SampleTimes {
                counters_ms,
                threads_ms: thread_report.map(|r| r.timestamp_ms),
                frames_ms: self.frames.last_frame_ms(),
            },
        }
    }

    fn tick_aggregator(&self) -> HealthReport {
        self.aggregator.tick(self.collect_metrics())
    }

    fn check_cycles(&self) -> CycleScan {
        let roots: Vec<ObjectRef> = self
            .tracker
            .live_roots()
            .into_iter()
            .map(|(_, root)| root)
            .collect();
        self.graph.scan_roots(&roots)
    }
}

/// Explicit handle to one running detection engine.
pub struct Engine {
    config: RwLock<EngineConfig>,
    subsystems: Arc<Subsystems>,
    bus: FindingBus,
    clock: SharedClock,
    tasks: Mutex<Vec<PeriodicHandle>>,
}

impl Engine {
    /// Build an engine on the system clock.
    pub fn new(config: EngineConfig, host: HostCapabilities) -> Result<Self> {
        Self::with_clock(config, host, SystemClock::shared())
    }

    /// Build an engine on an explicit clock, e.g. a `ManualClock` in tests.
    pub fn with_clock(config: EngineConfig, host: HostCapabilities, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let bus = FindingBus::new(config.bus_capacity);

        let subsystems = Subsystems {
            tracker: ObjectLifecycleTracker::new(config.lifecycle.clone(), clock.clone(), bus.clone()),
            graph: ReferenceGraphWalker::new(
                config.graph.clone(),
                host.references.clone(),
                clock.clone(),
                bus.clone(),
            ),
            threads: ThreadSnapshotSampler::new(
                config.threads.clone(),
                host.threads.clone(),
                clock.clone(),
                bus.clone(),
            ),
            watchdog: PrimaryThreadWatchdog::new(
                config.watchdog.clone(),
                host.primary.clone(),
                clock.clone(),
                bus.clone(),
            ),
            frames: Arc::new(FrameTimingSampler::new(config.frames.clone(), clock.clone(), bus.clone())),
            aggregator: AnomalyAggregator::new(config.aggregator.clone(), clock.clone(), bus.clone()),
            host,
            clock: clock.clone(),
        };
        info!(
            capabilities = ?subsystems.host.describe(),
            "Performance engine created"
        );

        Ok(Self {
            config: RwLock::new(config),
            subsystems: Arc::new(subsystems),
            bus,
            clock,
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the periodic task of every enabled, supported subsystem.
    ///
    /// Must be called inside a tokio runtime. Calling it while running is
    /// a no-op.
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Engine already running");
            return Ok(());
        }
        let config = self.config.read().clone();
        let s = &self.subsystems;
        let mut spawned = Vec::new();

        if config.lifecycle.enabled {
            let subsystems = Arc::clone(s);
            spawned.push(spawn_periodic(
                "lifecycle",
                Duration::from_millis(config.lifecycle.check_interval_ms),
                move || {
                    subsystems.tracker.check_for_leaks();
                },
            )?);
        }
        if config.graph.enabled {
            if s.graph.is_supported() {
                let subsystems = Arc::clone(s);
                spawned.push(spawn_periodic_blocking(
                    "graph",
                    Duration::from_millis(config.graph.scan_interval_ms),
                    move || {
                        subsystems.check_cycles();
                    },
                )?);
            } else {
                warn!(subsystem = "graph", "No reference enumerator registered; cycle detection unsupported");
            }
        }
        if config.threads.enabled {
            if s.threads.is_supported() {
                let subsystems = Arc::clone(s);
                spawned.push(spawn_periodic(
                    "threads",
                    Duration::from_millis(config.threads.sample_interval_ms),
                    move || {
                        subsystems.threads.sample();
                    },
                )?);
            } else {
                warn!(subsystem = "threads", "No thread enumerator registered; thread sampling unsupported");
            }
        }
        if config.watchdog.enabled {
            if s.watchdog.is_supported() {
                let subsystems = Arc::clone(s);
                spawned.push(spawn_periodic_blocking(
                    "watchdog",
                    Duration::from_millis(config.watchdog.check_interval_ms),
                    move || {
                        subsystems.watchdog.check();
                    },
                )?);
            } else {
                warn!(subsystem = "watchdog", "No primary context pinger registered; watchdog unsupported");
            }
        }
        if config.frames.enabled {
            let subsystems = Arc::clone(s);
            spawned.push(spawn_periodic(
                "frames",
                Duration::from_millis(config.frames.sample_interval_ms),
                move || {
                    subsystems.frames.sample();
                },
            )?);
        }
        if config.aggregator.enabled {
            let subsystems = Arc::clone(s);
            spawned.push(spawn_periodic(
                "aggregator",
                Duration::from_millis(config.aggregator.tick_interval_ms),
                move || {
                    subsystems.tick_aggregator();
                },
            )?);
        }

        info!(
            tasks = ?spawned.iter().map(PeriodicHandle::name).collect::<Vec<_>>(),
            "Performance engine started"
        );
        *tasks = spawned;
        Ok(())
    }

    /// Stop every periodic task and wait for them. History is kept.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.stop().await;
        }
        info!("Performance engine stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(PeriodicHandle::is_running)
    }

    /// Clear histories, tracked objects, and alerts. Configuration stays.
    pub fn reset(&self) {
        let s = &self.subsystems;
        s.tracker.clear();
        s.graph.clear();
        s.threads.clear();
        s.watchdog.clear();
        s.frames.clear();
        s.aggregator.clear();
        info!("Performance engine reset");
    }

    /// Validate and apply a new configuration to every subsystem.
    ///
    /// Nothing is applied if validation fails, including a changed
    /// ring-buffer capacity. New intervals take effect on the next `start()`.
    pub fn configure(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let s = &self.subsystems;
        s.graph.check_update(&config.graph)?;
        s.threads.check_update(&config.threads)?;
        s.watchdog.check_update(&config.watchdog)?;
        s.frames.check_update(&config.frames)?;
        s.tracker.configure(config.lifecycle.clone())?;
        s.graph.configure(config.graph.clone())?;
        s.threads.configure(config.threads.clone())?;
        s.watchdog.configure(config.watchdog.clone())?;
        s.frames.configure(config.frames.clone())?;
        s.aggregator.configure(config.aggregator.clone())?;
        *self.config.write() = config;
        debug!("Engine configuration applied");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    // =========================================================================
    // Host integration
    // =========================================================================

    /// Feed the frame sampler from a host frame clock.
    pub fn attach_frame_clock(&self, frame_clock: &dyn FrameClock) -> Result<()> {
        self.subsystems.frames.attach(frame_clock)?;
        Ok(())
    }

    /// Walk from every live tracked object, reporting each cycle once.
    pub fn check_cycles(&self) -> Result<CycleScan> {
        if !self.subsystems.graph.is_supported() {
            return Err(Error::Unsupported(
                "cycle detection needs a reference enumerator".to_string(),
            ));
        }
        Ok(self.subsystems.check_cycles())
    }

    /// Run one aggregation pass now.
    pub fn tick_aggregator(&self) -> HealthReport {
        self.subsystems.tick_aggregator()
    }

    // =========================================================================
    // Subscriptions and accessors
    // =========================================================================

    #[must_use]
    pub fn subscribe(&self) -> FindingSubscription {
        self.bus.subscribe()
    }

    #[must_use]
    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = FindingKind>) -> FindingSubscription {
        self.bus.subscribe_to(kinds)
    }

    #[must_use]
    pub fn bus(&self) -> &FindingBus {
        &self.bus
    }

    #[must_use]
    pub fn tracker(&self) -> &ObjectLifecycleTracker {
        &self.subsystems.tracker
    }

    #[must_use]
    pub fn graph(&self) -> &ReferenceGraphWalker {
        &self.subsystems.graph
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadSnapshotSampler {
        &self.subsystems.threads
    }

    #[must_use]
    pub fn watchdog(&self) -> &PrimaryThreadWatchdog {
        &self.subsystems.watchdog
    }

    #[must_use]
    pub fn frames(&self) -> &Arc<FrameTimingSampler> {
        &self.subsystems.frames
    }

    #[must_use]
    pub fn aggregator(&self) -> &AnomalyAggregator {
        &self.subsystems.aggregator
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.subsystems.aggregator.alerts()
    }

    #[must_use]
    pub fn supported(&self) -> SupportMatrix {
        let s = &self.subsystems;
        SupportMatrix {
            lifecycle: true,
            reference_cycles: s.graph.is_supported(),
            threads: s.threads.is_supported(),
            watchdog: s.watchdog.is_supported(),
            frames: true,
            host_counters: s.host.counters.is_some(),
        }
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Snapshot of every derived structure.
    #[must_use]
    pub fn report(&self) -> EngineReport {
        let s = &self.subsystems;
        EngineReport {
            version: crate::VERSION.to_string(),
            generated_at_ms: self.clock.epoch_ms(),
            running: self.is_running(),
            supported: self.supported(),
            leaks: LeakSection {
                statistics: s.tracker.statistics(),
                candidates: s.tracker.last_candidates(),
            },
            cycles: s.graph.recent_cycles(),
            threads: ThreadSection {
                latest_snapshot: s.threads.latest_snapshot(),
                latest_report: s.threads.latest_report(),
                latest_deadlock: s.threads.latest_deadlock(),
                sample_failures: s.threads.failures(),
                history: s.threads.history_stats(),
            },
            watchdog: s.watchdog.report(),
            frames: FrameSection {
                report: s.frames.report(),
                history: s.frames.history(),
            },
            health: s.aggregator.latest_report(),
            alerts: s.aggregator.alerts(),
        }
    }

    /// [`report`](Self::report) as pretty-printed JSON.
    pub fn export_report(&self) -> Result<String> {
        Ok(self.report().to_json_pretty()?)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("host", &self.subsystems.host)
            .field("tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}
