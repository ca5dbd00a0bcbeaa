//! Finding bus: push-style delivery of everything the engine detects.
//!
//! Every subsystem holds a clone of one [`FindingBus`] and publishes as it
//! classifies. Subscribers get a [`FindingSubscription`], optionally filtered
//! to the kinds they care about. Publishing with nobody listening is normal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::aggregator::Alert;
use crate::frames::HitchEvent;
use crate::graph::CycleReport;
use crate::lifecycle::LeakCandidate;
use crate::threads::DeadlockCandidate;
use crate::watchdog::MainThreadBlockEvent;

/// Default number of findings a slow subscriber may fall behind by.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Anything the engine reports to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum Finding {
    /// A tracked object outlived the leak threshold, or its severity escalated.
    LeakFound(LeakCandidate),
    /// The reference walker closed a loop.
    CycleFound(CycleReport),
    /// Blocked threads repeated across consecutive snapshots.
    DeadlockSuspected(DeadlockCandidate),
    /// A single frame interval exceeded the hitch threshold.
    Hitch(HitchEvent),
    /// The primary loop answered a ping late, or not at all.
    MainThreadBlocked(MainThreadBlockEvent),
    /// Aggregate health moved by at least the configured epsilon.
    HealthScoreChanged {
        previous: Option<f64>,
        current: f64,
        timestamp_ms: u64,
    },
    /// A deduplicated alert from the aggregator.
    Alert(Alert),
}

/// Discriminant of [`Finding`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    LeakFound,
    CycleFound,
    DeadlockSuspected,
    Hitch,
    MainThreadBlocked,
    HealthScoreChanged,
    Alert,
}

impl Finding {
    #[must_use]
    pub fn kind(&self) -> FindingKind {
        match self {
            Self::LeakFound(_) => FindingKind::LeakFound,
            Self::CycleFound(_) => FindingKind::CycleFound,
            Self::DeadlockSuspected(_) => FindingKind::DeadlockSuspected,
            Self::Hitch(_) => FindingKind::Hitch,
            Self::MainThreadBlocked(_) => FindingKind::MainThreadBlocked,
            Self::HealthScoreChanged { .. } => FindingKind::HealthScoreChanged,
            Self::Alert(_) => FindingKind::Alert,
        }
    }
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeakFound => write!(f, "leak_found"),
            Self::CycleFound => write!(f, "cycle_found"),
            Self::DeadlockSuspected => write!(f, "deadlock_suspected"),
            Self::Hitch => write!(f, "hitch"),
            Self::MainThreadBlocked => write!(f, "main_thread_blocked"),
            Self::HealthScoreChanged => write!(f, "health_score_changed"),
            Self::Alert => write!(f, "alert"),
        }
    }
}

/// Broadcast fan-out of [`Finding`]s. Cheap to clone.
#[derive(Clone)]
pub struct FindingBus {
    sender: broadcast::Sender<Finding>,
    published: Arc<AtomicU64>,
}

impl Default for FindingBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl FindingBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to all current subscribers; returns how many received it.
    pub fn publish(&self, finding: Finding) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(finding).unwrap_or(0)
    }

    /// Subscribe to every finding kind.
    #[must_use]
    pub fn subscribe(&self) -> FindingSubscription {
        FindingSubscription {
            receiver: self.sender.subscribe(),
            kinds: None,
        }
    }

    /// Subscribe to a subset of finding kinds.
    #[must_use]
    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = FindingKind>) -> FindingSubscription {
        FindingSubscription {
            receiver: self.sender.subscribe(),
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Findings published since creation, delivered or not.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FindingBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FindingBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .finish()
    }
}

/// Receiving end of the bus.
pub struct FindingSubscription {
    receiver: broadcast::Receiver<Finding>,
    kinds: Option<BTreeSet<FindingKind>>,
}

impl FindingSubscription {
    fn wants(&self, finding: &Finding) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&finding.kind()))
    }

    /// Wait for the next matching finding; `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the overwritten findings.
    pub async fn recv(&mut self) -> Option<Finding> {
        loop {
            match self.receiver.recv().await {
                Ok(finding) if self.wants(&finding) => return Some(finding),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Finding subscriber lagged; oldest findings dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching finding already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Finding> {
        loop {
            match self.receiver.try_recv() {
                Ok(finding) if self.wants(&finding) => return Some(finding),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Finding subscriber lagged; oldest findings dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything currently queued that matches the filter.
    pub fn drain(&mut self) -> Vec<Finding> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::HitchSeverity;

    fn hitch(duration_ms: f64) -> Finding {
        Finding::Hitch(HitchEvent {
            duration_ms,
            expected_duration_ms: 16.67,
            severity: HitchSeverity::Minor,
            timestamp_ms: 1,
        })
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = FindingBus::new(8);
        assert_eq!(bus.publish(hitch(20.0)), 0);
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn subscriber_receives_in_order() {
        let bus = FindingBus::new(8);
        let mut sub = bus.subscribe();
        bus.publish(hitch(20.0));
        bus.publish(hitch(40.0));
        let got = sub.drain();
        assert_eq!(got.len(), 2);
        match &got[1] {
            Finding::Hitch(h) => assert_eq!(h.duration_ms, 40.0),
            other => panic!("unexpected finding {other:?}"),
        }
    }

    #[test]
    fn filtered_subscription_skips_other_kinds() {
        let bus = FindingBus::new(8);
        let mut sub = bus.subscribe_to([FindingKind::HealthScoreChanged]);
        bus.publish(hitch(20.0));
        bus.publish(Finding::HealthScoreChanged {
            previous: None,
            current: 90.0,
            timestamp_ms: 5,
        });
        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind(), FindingKind::HealthScoreChanged);
    }

    #[test]
    fn lagging_subscriber_keeps_newest() {
        let bus = FindingBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(hitch(f64::from(i)));
        }
        let got = sub.drain();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn finding_serializes_with_finding_tag() {
        let json = serde_json::to_string(&hitch(25.0)).unwrap();
        assert!(json.contains("\"finding\":\"hitch\""));
        assert!(json.contains("\"duration_ms\":25.0"));
    }

    #[test]
    fn alert_finding_keeps_alert_type_field() {
        let finding = Finding::Alert(Alert {
            kind: crate::aggregator::AlertKind::CpuWarning,
            severity: crate::aggregator::AlertSeverity::Warning,
            message: "CPU usage at 85.0%".to_string(),
            timestamp_ms: 7,
        });
        let value = serde_json::to_value(&finding).unwrap();
        assert_eq!(value["finding"], "alert");
        assert_eq!(value["type"], "cpu_warning");
        let back: Finding = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), FindingKind::Alert);
    }

    #[tokio::test]
    async fn recv_returns_none_when_bus_dropped() {
        let bus = FindingBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(FindingKind::MainThreadBlocked.to_string(), "main_thread_blocked");
        assert_eq!(FindingKind::LeakFound.to_string(), "leak_found");
    }
}
