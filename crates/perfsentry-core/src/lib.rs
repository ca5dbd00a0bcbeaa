//! perfsentry-core: in-process performance anomaly detection
//!
//! Samples cheap host-provided counters and object-lifetime signals and
//! turns them into classified, severity-ranked findings plus one aggregate
//! health score with deduplicated alerts.
//!
//! # Architecture
//!
//! ```text
//! host capabilities ──► samplers ──► SampleRingBuffer
//!                          │
//!                          └──► FindingBus ──► AnomalyAggregator ──► alerts / health
//! ```
//!
//! # Modules
//!
//! - `ring_buffer`: fixed-capacity, oldest-evicted sample storage
//! - `lifecycle`: weak-handle object tracking and age-based leak candidates
//! - `graph`: bounded reference-cycle search over host-described edges
//! - `threads`: thread snapshots, health scoring, deadlock heuristic
//! - `watchdog`: primary-thread responsiveness pings
//! - `frames`: frame intervals, jank scoring, hitch classification
//! - `aggregator`: composite health score and deduplicated alerts
//! - `engine`: the handle that owns and schedules all of the above
//! - `events`: broadcast bus of findings
//! - `host`: capability traits and Linux `/proc` implementations
//! - `clock`: injectable clock (manual clock for tests)
//! - `periodic`: cancellable periodic tasks on tokio
//! - `config`: TOML-loadable configuration with validation
//! - `logging`: `tracing` subscriber setup
//! - `report`: serializable engine report
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod frames;
pub mod graph;
pub mod host;
pub mod lifecycle;
pub mod logging;
pub mod periodic;
pub mod report;
pub mod ring_buffer;
pub mod threads;
pub mod watchdog;

pub use aggregator::{Alert, AlertKind, AlertSeverity, AnomalyAggregator, HealthReport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, Error, HostError, Result};
pub use events::{Finding, FindingBus, FindingKind, FindingSubscription};
pub use frames::{FrameTimingSampler, JankAnalyzer};
pub use graph::{ObjectRef, OutgoingRef, ReferenceEnumerator, ReferenceGraphWalker, ReferenceRegistry};
pub use host::HostCapabilities;
pub use lifecycle::{LeakCandidate, LeakSeverity, ObjectLifecycleTracker};
pub use report::EngineReport;
pub use ring_buffer::{RingBuffer, SampleRingBuffer};
pub use threads::{DeadlockCandidate, ThreadSnapshotSampler};
pub use watchdog::{PrimaryThreadWatchdog, primary_loop_channel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
