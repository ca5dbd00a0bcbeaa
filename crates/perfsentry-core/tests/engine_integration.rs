//! End-to-end tests through the `Engine` handle.
//!
//! Every scenario runs on a `ManualClock`, so ages and dedup windows are
//! deterministic. The scheduler test uses paused tokio time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perfsentry_core::aggregator::{AlertKind, AlertSeverity};
use perfsentry_core::clock::ManualClock;
use perfsentry_core::config::EngineConfig;
use perfsentry_core::engine::Engine;
use perfsentry_core::error::HostError;
use perfsentry_core::events::{Finding, FindingKind};
use perfsentry_core::graph::{OutgoingRef, ReferenceEnumerator, ReferenceRegistry};
use perfsentry_core::host::{HostCapabilities, HostCounterSample, HostCounters, ThreadEnumerator};
use perfsentry_core::lifecycle::LeakSeverity;
use perfsentry_core::threads::{RunState, ThreadInfo};
use perfsentry_core::watchdog::primary_loop_channel;

// =============================================================================
// Fixtures
// =============================================================================

fn engine_with(host: HostCapabilities) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let engine = Engine::with_clock(EngineConfig::default(), host, clock.clone()).unwrap();
    (engine, clock)
}

struct Session;

struct Link {
    next: Mutex<Option<Arc<Link>>>,
}

impl Link {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(None),
        })
    }

    fn point_to(&self, other: &Arc<Link>) {
        *self.next.lock().unwrap() = Some(Arc::clone(other));
    }

    fn unlink(&self) {
        *self.next.lock().unwrap() = None;
    }
}

fn link_registry() -> Arc<dyn ReferenceEnumerator> {
    let registry = ReferenceRegistry::new();
    registry.register::<Link, _>(|link| {
        link.next
            .lock()
            .unwrap()
            .iter()
            .map(|n| OutgoingRef::labeled(n, "next"))
            .collect()
    });
    Arc::new(registry)
}

/// Replays scripted snapshots, repeating the last one.
struct ScriptedThreads {
    script: Mutex<VecDeque<Vec<ThreadInfo>>>,
}

impl ScriptedThreads {
    fn new(script: Vec<Vec<ThreadInfo>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

impl ThreadEnumerator for ScriptedThreads {
    fn enumerate_live_threads(&self) -> Result<Vec<ThreadInfo>, HostError> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.pop_front().unwrap_or_default())
        } else {
            script
                .front()
                .cloned()
                .ok_or_else(|| HostError::Failed("script exhausted".to_string()))
        }
    }
}

fn thread(id: u64, run_state: RunState) -> ThreadInfo {
    ThreadInfo {
        thread_id: id,
        name: Some(format!("worker-{id}")),
        cpu_usage_pct: 1.0,
        run_state,
        is_primary_thread: id == 1,
    }
}

struct HotMemory;

impl HostCounters for HotMemory {
    fn sample(&self) -> Result<HostCounterSample, HostError> {
        Ok(HostCounterSample {
            memory_used_bytes: Some(85),
            memory_total_bytes: Some(100),
            cpu_usage_pct: Some(20.0),
            network_success_pct: Some(100.0),
            ..HostCounterSample::default()
        })
    }
}

// =============================================================================
// Leak aging end to end
// =============================================================================

#[test]
fn leak_ages_then_clears_when_dropped() {
    let (engine, clock) = engine_with(HostCapabilities::none());
    let mut leaks = engine.subscribe_to([FindingKind::LeakFound]);
    let tracker = engine.tracker();

    let keeper = Arc::new(Session);
    let session = Arc::new(Session);
    tracker.track(&keeper, Some("keeper"));
    tracker.track(&session, Some("session-1"));

    clock.advance(Duration::from_secs(35));
    let candidates = tracker.check_for_leaks();
    assert_eq!(candidates.len(), 2);
    let found = candidates.iter().find(|c| c.identifier == "session-1").unwrap();
    assert_eq!(found.severity, LeakSeverity::Low);
    assert!(found.heuristic);

    clock.set(Duration::from_secs(400));
    let candidates = tracker.check_for_leaks();
    let found = candidates.iter().find(|c| c.identifier == "session-1").unwrap();
    assert_eq!(found.severity, LeakSeverity::High);

    let alive_before = tracker.statistics().alive;
    drop(session);
    let candidates = tracker.check_for_leaks();
    assert!(candidates.iter().all(|c| c.identifier != "session-1"));
    assert_eq!(tracker.statistics().alive, alive_before - 1);

    drop(keeper);
    assert!(tracker.check_for_leaks().is_empty());

    // Low then High for each object.
    assert_eq!(leaks.drain().len(), 4);
}

// =============================================================================
// Reference cycles
// =============================================================================

#[test]
fn three_object_cycle_found_from_tracked_roots() {
    let (engine, _clock) = engine_with(HostCapabilities::none().with_references(link_registry()));
    let (a, b, c) = (Link::new(), Link::new(), Link::new());
    a.point_to(&b);
    b.point_to(&c);
    c.point_to(&a);
    engine.tracker().track(&a, Some("a"));
    engine.tracker().track(&b, Some("b"));
    engine.tracker().track(&c, Some("c"));

    let scan = engine.check_cycles().unwrap();
    assert_eq!(scan.cycles.len(), 1);
    assert_eq!(scan.cycles[0].length, 3);
    assert_eq!(scan.cycles[0].describe(), "Link -> Link -> Link -> Link");
    assert_eq!(engine.graph().recent_cycles().len(), 1);

    let report = engine.tick_aggregator();
    assert!(report.new_alerts.iter().any(|a| a.kind == AlertKind::ReferenceCycle));

    a.unlink();
    b.unlink();
    c.unlink();
}

// =============================================================================
// Alerts
// =============================================================================

#[test]
fn memory_warning_dedups_within_window() {
    let (engine, clock) = engine_with(HostCapabilities::none().with_counters(Arc::new(HotMemory)));

    let first = engine.tick_aggregator();
    assert_eq!(first.new_alerts.len(), 1);
    assert_eq!(first.new_alerts[0].kind, AlertKind::MemoryWarning);
    assert_eq!(first.new_alerts[0].severity, AlertSeverity::Warning);

    clock.advance(Duration::from_secs(1));
    assert!(engine.tick_aggregator().new_alerts.is_empty());
    assert_eq!(engine.alerts().len(), 1);

    clock.advance(Duration::from_secs(10));
    assert_eq!(engine.tick_aggregator().new_alerts.len(), 1);
    assert_eq!(engine.alerts().len(), 2);
}

#[test]
fn stale_frame_and_thread_data_stop_counting() {
    let script = ScriptedThreads::new(vec![vec![thread(1, RunState::Running), thread(2, RunState::Running)]]);
    let (engine, clock) = engine_with(HostCapabilities::none().with_threads(script));
    engine.threads().sample();
    for _ in 0..10 {
        engine.frames().record_interval(Duration::from_millis(100));
    }

    let fresh = engine.tick_aggregator();
    assert!((fresh.metrics.fps.unwrap() - 10.0).abs() < 1e-9);
    assert!(fresh.completeness.thread);
    assert!(!fresh.completeness.stale.any());
    assert!(fresh.new_alerts.iter().any(|a| a.kind == AlertKind::CriticalFps));

    clock.advance(Duration::from_secs(3600));
    let stale = engine.tick_aggregator();
    assert!(stale.metrics.fps.is_none());
    assert!(stale.metrics.thread_health_score.is_none());
    assert!(stale.completeness.stale.frames);
    assert!(stale.completeness.stale.threads);
    assert!(!stale.completeness.thread);
    assert!(!stale.completeness.complete);
    assert!(stale.new_alerts.is_empty());
    assert_eq!(engine.alerts().len(), 1);

    // A fresh sample brings the thread signal back.
    engine.threads().sample();
    let recovered = engine.tick_aggregator();
    assert!(recovered.completeness.thread);
    assert!(!recovered.completeness.stale.threads);
    assert!(recovered.completeness.stale.frames);
}

// =============================================================================
// Threads
// =============================================================================

#[test]
fn deadlock_needs_two_consecutive_blocked_snapshots() {
    let script = ScriptedThreads::new(vec![
        vec![
            thread(1, RunState::Running),
            thread(2, RunState::Waiting),
            thread(3, RunState::Running),
        ],
        vec![
            thread(1, RunState::Running),
            thread(2, RunState::Waiting),
            thread(3, RunState::Uninterruptible),
        ],
        vec![
            thread(1, RunState::Running),
            thread(2, RunState::Waiting),
            thread(3, RunState::Uninterruptible),
        ],
    ]);
    let (engine, _clock) = engine_with(HostCapabilities::none().with_threads(script));
    let mut deadlocks = engine.subscribe_to([FindingKind::DeadlockSuspected]);

    engine.threads().sample();
    engine.threads().sample();
    assert!(engine.threads().latest_deadlock().is_none());

    engine.threads().sample();
    let candidate = engine.threads().latest_deadlock().unwrap();
    assert_eq!(candidate.involved_thread_ids.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    assert!(candidate.heuristic);

    // Same set again: still standing, not republished.
    engine.threads().sample();
    assert!(engine.threads().latest_deadlock().is_some());
    assert_eq!(deadlocks.drain().len(), 1);

    let report = engine.tick_aggregator();
    assert!(report.metrics.deadlock_suspected);
    assert!(report.completeness.thread);
    assert!(
        report
            .new_alerts
            .iter()
            .any(|a| a.kind == AlertKind::DeadlockSuspected && a.severity == AlertSeverity::Critical)
    );
}

// =============================================================================
// Watchdog
// =============================================================================

#[test]
fn unanswered_ping_is_a_timed_out_block() {
    let (pinger, responder) = primary_loop_channel();
    let mut config = EngineConfig::default();
    config.watchdog.ping_timeout_ms = 50;
    let engine = Engine::with_clock(
        config,
        HostCapabilities::none().with_primary(Arc::new(pinger)),
        Arc::new(ManualClock::default()),
    )
    .unwrap();
    let mut blocks = engine.subscribe_to([FindingKind::MainThreadBlocked]);

    let event = engine.watchdog().check().unwrap();
    assert!(event.timed_out);
    assert_eq!(responder.pending(), 1);
    assert_eq!(responder.drain(), 1);

    match blocks.try_recv() {
        Some(Finding::MainThreadBlocked(published)) => assert_eq!(published, event),
        other => panic!("expected a block finding, got {other:?}"),
    }
    let report = engine.tick_aggregator();
    assert!(
        report
            .new_alerts
            .iter()
            .any(|a| a.kind == AlertKind::MainThreadBlocked && a.severity == AlertSeverity::Critical)
    );
}

// =============================================================================
// Report export
// =============================================================================

#[test]
fn export_report_contains_every_section() {
    let (engine, clock) = engine_with(HostCapabilities::none().with_counters(Arc::new(HotMemory)));
    let session = Arc::new(Session);
    engine.tracker().track(&session, Some("session-1"));
    clock.advance(Duration::from_secs(90));
    engine.tracker().check_for_leaks();
    engine.frames().record_interval(Duration::from_millis(16));
    engine.frames().record_interval(Duration::from_millis(300));
    engine.frames().sample();
    engine.tick_aggregator();

    let json = engine.export_report().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    for key in [
        "version",
        "generated_at_ms",
        "running",
        "supported",
        "leaks",
        "cycles",
        "threads",
        "watchdog",
        "frames",
        "health",
        "alerts",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(value["leaks"]["candidates"][0]["severity"], "medium");
    assert_eq!(value["leaks"]["candidates"][0]["heuristic"], true);
    assert_eq!(value["frames"]["report"]["recent_hitches"][0]["severity"], "severe");
    assert_eq!(value["supported"]["threads"], false);
    assert!(value["health"]["health_score"].as_f64().is_some());
    assert_eq!(value["health"]["completeness"]["thread"], false);
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stop_halts_sampling_but_keeps_history() {
    let script = ScriptedThreads::new(vec![vec![thread(1, RunState::Running)]]);
    let (engine, _clock) = engine_with(HostCapabilities::none().with_threads(script));

    engine.start().unwrap();
    assert!(engine.is_running());
    engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let sampled = engine.threads().history().len();
    assert!(sampled >= 4, "expected several samples, got {sampled}");
    assert!(engine.aggregator().latest_report().is_some());

    engine.stop().await;
    assert!(!engine.is_running());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.threads().history().len(), sampled);

    engine.reset();
    assert!(engine.threads().history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scheduled_graph_scan_finds_cycle() {
    let mut config = EngineConfig::default();
    config.graph.enabled = true;
    config.graph.scan_interval_ms = 1_000;
    let host = HostCapabilities::none().with_references(link_registry());
    let engine = Engine::with_clock(config, host, Arc::new(ManualClock::default())).unwrap();
    let (a, b) = (Link::new(), Link::new());
    a.point_to(&b);
    b.point_to(&a);
    engine.tracker().track(&a, Some("a"));
    engine.tracker().track(&b, Some("b"));

    engine.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    engine.stop().await;

    assert!(!engine.graph().recent_cycles().is_empty());
    a.unlink();
    b.unlink();
}
