//! Object lifecycle tracking and age-based leak heuristics.
//!
//! The tracker holds only weak handles. An object that is still alive after
//! `leak_threshold_ms` becomes a [`LeakCandidate`] with a severity stepped by
//! age. Nothing here proves a leak: long-lived caches and singletons look the
//! same, so every candidate is flagged `heuristic`.
//!
//! Sweeps snapshot the weak handles under the lock, test liveness outside it,
//! then write results back. `track` can run concurrently with a sweep, and no
//! referent destructor ever runs while the tracker holds a lock.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{ensure_ascending, ensure_capacity, ensure_positive_ms};
use crate::error::ConfigError;
use crate::events::{Finding, FindingBus};
use crate::graph::ObjectRef;

type AnyWeak = Weak<dyn Any + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`ObjectLifecycleTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Whether the engine runs periodic leak sweeps.
    pub enabled: bool,
    /// Age past which a live object becomes a leak candidate.
    pub leak_threshold_ms: u64,
    /// Sweep cadence when driven by the engine.
    pub check_interval_ms: u64,
    /// Tracked entries beyond this evict the oldest first.
    pub max_tracked: usize,
    /// Age at which severity steps to medium.
    pub medium_after_ms: u64,
    /// Age at which severity steps to high.
    pub high_after_ms: u64,
    /// Age at which severity steps to critical.
    pub critical_after_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            leak_threshold_ms: 30_000,
            check_interval_ms: 10_000,
            max_tracked: 10_000,
            medium_after_ms: 60_000,
            high_after_ms: 300_000,
            critical_after_ms: 900_000,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive_ms("lifecycle.leak_threshold_ms", self.leak_threshold_ms)?;
        ensure_positive_ms("lifecycle.check_interval_ms", self.check_interval_ms)?;
        ensure_capacity("lifecycle.max_tracked", self.max_tracked)?;
        ensure_ascending(
            "lifecycle severity steps",
            &[self.medium_after_ms, self.high_after_ms, self.critical_after_ms],
        )
    }
}

// =============================================================================
// Types
// =============================================================================

/// Age-stepped leak severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl LeakSeverity {
    /// Step function over object age.
    #[must_use]
    pub fn for_age(age: Duration, config: &LifecycleConfig) -> Self {
        let age_ms = age.as_millis();
        if age_ms < u128::from(config.medium_after_ms) {
            Self::Low
        } else if age_ms < u128::from(config.high_after_ms) {
            Self::Medium
        } else if age_ms < u128::from(config.critical_after_ms) {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for LeakSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A tracked object that outlived the leak threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakCandidate {
    pub identifier: String,
    pub class_name: String,
    pub age_ms: u64,
    pub severity: LeakSeverity,
    /// Wall time of the first sweep that flagged this object.
    pub first_detected_at_ms: u64,
    /// Always true: age alone cannot prove a leak.
    pub heuristic: bool,
}

impl LeakCandidate {
    #[must_use]
    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age_ms)
    }
}

/// Returned by `track`; identifies the entry in reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackingId {
    seq: u64,
    identifier: String,
}

impl TrackingId {
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

/// Read-only view of one tracked entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub identifier: String,
    pub class_name: String,
    pub created_at_ms: u64,
    /// Wall time of the last sweep that found the object alive; creation
    /// time until the first sweep.
    pub last_seen_alive_ms: u64,
    pub age_ms: u64,
    pub alive: bool,
    pub flagged: bool,
}

/// Counters over the tracker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStatistics {
    pub total_tracked: u64,
    /// Entries not yet observed dead by a sweep.
    pub alive: usize,
    /// Entries pruned because their referent was gone.
    pub deallocated: u64,
    /// Entries dropped because `max_tracked` was exceeded.
    pub evicted: u64,
    /// Entries removed through `untrack`.
    pub untracked: u64,
    /// Candidates found by the most recent sweep.
    pub potential_leaks: usize,
    pub per_class: BTreeMap<String, usize>,
    pub last_check_ms: Option<u64>,
}

struct TrackedEntry {
    identifier: String,
    class_name: String,
    handle: AnyWeak,
    created_at: Duration,
    created_epoch_ms: u64,
    last_seen_alive: Duration,
    first_detected_ms: Option<u64>,
    reported_severity: Option<LeakSeverity>,
}

#[derive(Default)]
struct TrackerState {
    entries: BTreeMap<u64, TrackedEntry>,
    next_seq: u64,
    total_tracked: u64,
    deallocated: u64,
    evicted: u64,
    untracked: u64,
    last_candidates: Vec<LeakCandidate>,
    last_check_ms: Option<u64>,
}

impl TrackerState {
    fn evict_over(&mut self, max_tracked: usize) -> u64 {
        let mut evicted = 0;
        while self.entries.len() > max_tracked && self.entries.pop_first().is_some() {
            evicted += 1;
        }
        self.evicted += evicted;
        evicted
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Weak-reference registry with periodic leak sweeps.
pub struct ObjectLifecycleTracker {
    config: RwLock<LifecycleConfig>,
    state: Mutex<TrackerState>,
    sweep: Mutex<()>,
    clock: SharedClock,
    bus: FindingBus,
}

impl ObjectLifecycleTracker {
    #[must_use]
    pub fn new(config: LifecycleConfig, clock: SharedClock, bus: FindingBus) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(TrackerState::default()),
            sweep: Mutex::new(()),
            clock,
            bus,
        }
    }

    /// Start tracking `object` without extending its lifetime.
    ///
    /// `identifier` defaults to the type name plus the object's address.
    pub fn track<T: Any + Send + Sync>(&self, object: &Arc<T>, identifier: Option<&str>) -> TrackingId {
        let weak: Weak<T> = Arc::downgrade(object);
        let handle: AnyWeak = weak;
        let class_name = short_type_name(std::any::type_name::<T>());
        self.insert(handle, class_name.to_string(), identifier)
    }

    /// Track an already type-erased object under an explicit class name.
    pub fn track_dyn(
        &self,
        object: &Arc<dyn Any + Send + Sync>,
        class_name: &str,
        identifier: Option<&str>,
    ) -> TrackingId {
        self.insert(Arc::downgrade(object), class_name.to_string(), identifier)
    }

    fn insert(&self, handle: AnyWeak, class_name: String, identifier: Option<&str>) -> TrackingId {
        let identifier = identifier.map_or_else(
            || format!("{class_name}@{:#x}", handle.as_ptr().cast::<()>() as usize),
            str::to_string,
        );
        let now = self.clock.now();
        let created_epoch_ms = self.clock.epoch_ms();
        let max_tracked = self.config.read().max_tracked;

        let (seq, evicted) = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.total_tracked += 1;
            state.entries.insert(
                seq,
                TrackedEntry {
                    identifier: identifier.clone(),
                    class_name,
                    handle,
                    created_at: now,
                    created_epoch_ms,
                    last_seen_alive: now,
                    first_detected_ms: None,
                    reported_severity: None,
                },
            );
            (seq, state.evict_over(max_tracked))
        };

        if evicted > 0 {
            debug!(subsystem = "lifecycle", evicted, max_tracked, "Tracker full; evicted oldest entries");
        }
        TrackingId { seq, identifier }
    }

    /// Prune dead entries and return every live object older than the threshold.
    ///
    /// Newly flagged objects, and objects whose severity stepped up, are
    /// published as [`Finding::LeakFound`].
    pub fn check_for_leaks(&self) -> Vec<LeakCandidate> {
        let _sweep = self.sweep.lock();
        let config = self.config.read().clone();
        let threshold = Duration::from_millis(config.leak_threshold_ms);
        let now = self.clock.now();
        let now_ms = self.clock.epoch_ms();

        let handles: Vec<(u64, AnyWeak)> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .map(|(seq, entry)| (*seq, entry.handle.clone()))
                .collect()
        };
        let (alive, dead): (Vec<_>, Vec<_>) = handles
            .iter()
            .map(|(seq, handle)| (*seq, handle.strong_count() > 0))
            .partition(|(_, is_alive)| *is_alive);
        drop(handles);

        let mut escalated = Vec::new();
        let (candidates, pruned, remaining) = {
            let mut state = self.state.lock();
            let mut pruned = 0u64;
            for (seq, _) in &dead {
                if state.entries.remove(seq).is_some() {
                    pruned += 1;
                }
            }
            state.deallocated += pruned;

            let mut candidates = Vec::new();
            for (seq, _) in &alive {
                // Evicted between the snapshot and now.
                let Some(entry) = state.entries.get_mut(seq) else {
                    continue;
                };
                entry.last_seen_alive = now;
                let age = now.saturating_sub(entry.created_at);
                if age <= threshold {
                    continue;
                }
                let first_detected_at_ms = *entry.first_detected_ms.get_or_insert(now_ms);
                let severity = LeakSeverity::for_age(age, &config);
                let candidate = LeakCandidate {
                    identifier: entry.identifier.clone(),
                    class_name: entry.class_name.clone(),
                    age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    severity,
                    first_detected_at_ms,
                    heuristic: true,
                };
                if entry.reported_severity != Some(severity) {
                    entry.reported_severity = Some(severity);
                    escalated.push(candidate.clone());
                }
                candidates.push(candidate);
            }

            state.last_candidates.clone_from(&candidates);
            state.last_check_ms = Some(now_ms);
            (candidates, pruned, state.entries.len())
        };

        for candidate in escalated {
            warn!(
                subsystem = "lifecycle",
                identifier = %candidate.identifier,
                class = %candidate.class_name,
                age_ms = candidate.age_ms,
                severity = %candidate.severity,
                "Potential leak: object outlived threshold"
            );
            self.bus.publish(Finding::LeakFound(candidate));
        }
        debug!(
            subsystem = "lifecycle",
            alive = remaining,
            pruned,
            candidates = candidates.len(),
            "Leak sweep complete"
        );
        candidates
    }

    /// Candidates from the most recent sweep.
    #[must_use]
    pub fn last_candidates(&self) -> Vec<LeakCandidate> {
        self.state.lock().last_candidates.clone()
    }

    #[must_use]
    pub fn statistics(&self) -> LifecycleStatistics {
        let state = self.state.lock();
        let mut per_class = BTreeMap::new();
        for entry in state.entries.values() {
            *per_class.entry(entry.class_name.clone()).or_insert(0) += 1;
        }
        LifecycleStatistics {
            total_tracked: state.total_tracked,
            alive: state.entries.len(),
            deallocated: state.deallocated,
            evicted: state.evicted,
            untracked: state.untracked,
            potential_leaks: state.last_candidates.len(),
            per_class,
            last_check_ms: state.last_check_ms,
        }
    }

    /// Snapshot of every tracked entry, oldest first.
    #[must_use]
    pub fn tracked_objects(&self) -> Vec<TrackedObject> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .entries
            .values()
            .map(|entry| TrackedObject {
                identifier: entry.identifier.clone(),
                class_name: entry.class_name.clone(),
                created_at_ms: entry.created_epoch_ms,
                last_seen_alive_ms: entry.created_epoch_ms.saturating_add(
                    u64::try_from(entry.last_seen_alive.saturating_sub(entry.created_at).as_millis())
                        .unwrap_or(u64::MAX),
                ),
                age_ms: u64::try_from(now.saturating_sub(entry.created_at).as_millis())
                    .unwrap_or(u64::MAX),
                alive: entry.handle.strong_count() > 0,
                flagged: entry.first_detected_ms.is_some(),
            })
            .collect()
    }

    /// Strong handles to every still-live tracked object, for cycle walks.
    ///
    /// The returned handles keep their objects alive until dropped.
    #[must_use]
    pub fn live_roots(&self) -> Vec<(String, ObjectRef)> {
        let handles: Vec<(String, String, AnyWeak)> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .map(|e| (e.identifier.clone(), e.class_name.clone(), e.handle.clone()))
                .collect()
        };
        handles
            .into_iter()
            .filter_map(|(identifier, class_name, handle)| {
                handle
                    .upgrade()
                    .map(|object| (identifier, ObjectRef::from_dyn(object, class_name)))
            })
            .collect()
    }

    /// Monotonic time the entry was last seen alive by a sweep.
    #[must_use]
    pub fn last_seen_alive(&self, id: &TrackingId) -> Option<Duration> {
        self.state.lock().entries.get(&id.seq).map(|e| e.last_seen_alive)
    }

    /// Stop tracking one entry.
    pub fn untrack(&self, id: &TrackingId) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(&id.seq).is_some();
        if removed {
            state.untracked += 1;
        }
        removed
    }

    /// Drop every entry and reset all counters.
    pub fn clear(&self) {
        let _sweep = self.sweep.lock();
        let old = std::mem::take(&mut *self.state.lock());
        drop(old);
    }

    #[must_use]
    pub fn config(&self) -> LifecycleConfig {
        self.config.read().clone()
    }

    /// Replace the configuration; a smaller `max_tracked` evicts immediately.
    pub fn configure(&self, config: LifecycleConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let max_tracked = config.max_tracked;
        *self.config.write() = config;
        let evicted = self.state.lock().evict_over(max_tracked);
        if evicted > 0 {
            debug!(subsystem = "lifecycle", evicted, max_tracked, "Tracker shrunk; evicted oldest entries");
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectLifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ObjectLifecycleTracker")
            .field("tracked", &state.entries.len())
            .field("total_tracked", &state.total_tracked)
            .finish_non_exhaustive()
    }
}

/// `alloc::sync::Arc<my_app::Session>` style paths reduced to the last segment
/// before any generic arguments.
pub(crate) fn short_type_name(full: &str) -> &str {
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}
