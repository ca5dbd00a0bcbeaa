//! Reference-graph walking and cycle detection.
//!
//! Rust has no runtime reflection, so outgoing references come from an
//! opt-in [`ReferenceEnumerator`]. The stock implementation is
//! [`ReferenceRegistry`], where each type registers a closure listing the
//! `Arc`s it holds. Objects of unregistered types are opaque leaves.
//!
//! The walk is an iterative depth-first search with two sets: `on_path`
//! (nodes on the current DFS path) and `fully_explored` (nodes whose subtree
//! is done). Meeting an `on_path` node closes a cycle; meeting a
//! `fully_explored` node is skipped. This keeps the walk linear in the graph
//! size and free of false positives on DAGs that share children. Depth and
//! node budgets bound the cost; hitting either marks the scan truncated.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{ensure_capacity, ensure_fixed_capacity, ensure_positive_ms};
use crate::error::ConfigError;
use crate::events::{Finding, FindingBus};
use crate::lifecycle::short_type_name;
use crate::ring_buffer::SampleRingBuffer;

/// Identity of a live object: the address of its allocation.
pub type ObjectId = usize;

// =============================================================================
// Object handles
// =============================================================================

/// Type-erased strong handle plus a display name for reports.
#[derive(Clone)]
pub struct ObjectRef {
    object: Arc<dyn Any + Send + Sync>,
    class_name: String,
}

impl ObjectRef {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(object: &Arc<T>) -> Self {
        Self {
            object: Arc::clone(object) as Arc<dyn Any + Send + Sync>,
            class_name: short_type_name(std::any::type_name::<T>()).to_string(),
        }
    }

    #[must_use]
    pub fn from_dyn(object: Arc<dyn Any + Send + Sync>, class_name: impl Into<String>) -> Self {
        Self {
            object,
            class_name: class_name.into(),
        }
    }

    /// Address-based identity, stable while any handle is held.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        Arc::as_ptr(&self.object).cast::<()>() as usize
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn concrete_type_id(&self) -> TypeId {
        Any::type_id(&*self.object)
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        &*self.object
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#x}", self.class_name, self.id())
    }
}

/// One outgoing strong reference, optionally labeled with the field name.
#[derive(Debug, Clone)]
pub struct OutgoingRef {
    pub target: ObjectRef,
    pub label: Option<String>,
}

impl OutgoingRef {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(target: &Arc<T>) -> Self {
        Self {
            target: ObjectRef::new(target),
            label: None,
        }
    }

    #[must_use]
    pub fn labeled<T: Any + Send + Sync>(target: &Arc<T>, label: impl Into<String>) -> Self {
        Self {
            target: ObjectRef::new(target),
            label: Some(label.into()),
        }
    }
}

// =============================================================================
// Reference enumeration
// =============================================================================

/// Host capability: list the strong references an object holds.
pub trait ReferenceEnumerator: Send + Sync {
    /// `None` when the object's type has not opted in.
    fn outgoing_references(&self, object: &ObjectRef) -> Option<Vec<OutgoingRef>>;
}

type RefFn = Box<dyn Fn(&dyn Any) -> Vec<OutgoingRef> + Send + Sync>;

/// Per-type registry of reference-listing closures.
#[derive(Default)]
pub struct ReferenceRegistry {
    by_type: RwLock<HashMap<TypeId, RefFn>>,
}

impl ReferenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opt `T` into cycle detection. Re-registering replaces the closure.
    pub fn register<T, F>(&self, references: F)
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Vec<OutgoingRef> + Send + Sync + 'static,
    {
        let erased: RefFn = Box::new(move |any: &dyn Any| {
            any.downcast_ref::<T>().map(&references).unwrap_or_default()
        });
        self.by_type.write().insert(TypeId::of::<T>(), erased);
    }

    #[must_use]
    pub fn is_registered<T: Any>(&self) -> bool {
        self.by_type.read().contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.read().is_empty()
    }
}

impl ReferenceEnumerator for ReferenceRegistry {
    fn outgoing_references(&self, object: &ObjectRef) -> Option<Vec<OutgoingRef>> {
        let by_type = self.by_type.read();
        by_type
            .get(&object.concrete_type_id())
            .map(|references| references(object.as_any()))
    }
}

impl std::fmt::Debug for ReferenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceRegistry")
            .field("types", &self.len())
            .finish()
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: ObjectId,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_id: ObjectId,
    pub to_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A closed loop of strong references, in path order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub objects: Vec<GraphNode>,
    /// One edge per hop; the last edge closes the loop.
    pub edges: Vec<GraphEdge>,
    pub length: usize,
    pub detected_at_ms: u64,
}

impl CycleReport {
    /// Class names around the loop, e.g. `A -> B -> C -> A`.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut names: Vec<&str> = self.objects.iter().map(|n| n.class_name.as_str()).collect();
        if let Some(first) = names.first().copied() {
            names.push(first);
        }
        names.join(" -> ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Every reachable node was explored.
    Complete,
    /// A depth or node budget cut part of the graph.
    Truncated,
    /// No reference enumerator is registered.
    Unsupported,
}

/// Outcome of one walk from a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleScan {
    pub status: ScanStatus,
    pub cycles: Vec<CycleReport>,
    pub nodes_visited: usize,
    /// Nodes of unregistered types, treated as leaves.
    pub opaque_nodes: usize,
    /// Nodes reached but not expanded because a budget ran out.
    pub truncated_nodes: Vec<GraphNode>,
}

impl CycleScan {
    fn unsupported() -> Self {
        Self {
            status: ScanStatus::Unsupported,
            cycles: Vec::new(),
            nodes_visited: 0,
            opaque_nodes: 0,
            truncated_nodes: Vec::new(),
        }
    }
}

// =============================================================================
// Walker
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Whether the engine periodically walks from every tracked object.
    pub enabled: bool,
    pub scan_interval_ms: u64,
    /// Longest DFS path before the walk stops descending.
    pub max_depth: usize,
    /// Total nodes one walk may expand.
    pub max_nodes: usize,
    /// Recent cycle reports kept for the engine report.
    pub history_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval_ms: 60_000,
            max_depth: 256,
            max_nodes: 100_000,
            history_capacity: 64,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive_ms("graph.scan_interval_ms", self.scan_interval_ms)?;
        ensure_capacity("graph.max_depth", self.max_depth)?;
        ensure_capacity("graph.max_nodes", self.max_nodes)?;
        ensure_capacity("graph.history_capacity", self.history_capacity)
    }
}

struct PathEntry {
    node: ObjectRef,
    /// Label of the edge from the previous path node into this one.
    via: Option<String>,
    children: std::vec::IntoIter<OutgoingRef>,
}

#[derive(Default)]
struct WalkState {
    path: Vec<PathEntry>,
    on_path: HashMap<ObjectId, usize>,
    fully_explored: HashSet<ObjectId>,
    // Keeps every visited allocation alive so addresses are not reused mid-walk.
    keepalive: Vec<ObjectRef>,
    cycles: Vec<CycleReport>,
    truncated: Vec<GraphNode>,
    opaque: usize,
}

/// Bounded cycle search over [`ReferenceEnumerator`] edges.
pub struct ReferenceGraphWalker {
    config: RwLock<GraphConfig>,
    enumerator: Option<Arc<dyn ReferenceEnumerator>>,
    history: SampleRingBuffer<CycleReport>,
    walk: Mutex<()>,
    clock: SharedClock,
    bus: FindingBus,
}

impl ReferenceGraphWalker {
    #[must_use]
    pub fn new(
        config: GraphConfig,
        enumerator: Option<Arc<dyn ReferenceEnumerator>>,
        clock: SharedClock,
        bus: FindingBus,
    ) -> Self {
        let history = SampleRingBuffer::new(config.history_capacity.max(1));
        Self {
            config: RwLock::new(config),
            enumerator,
            history,
            walk: Mutex::new(()),
            clock,
            bus,
        }
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.enumerator.is_some()
    }

    /// Cycles reachable from `root`.
    #[must_use]
    pub fn find_cycles(&self, root: &ObjectRef) -> Vec<CycleReport> {
        self.scan(root).cycles
    }

    /// Walk from `root`, publishing each cycle found.
    pub fn scan(&self, root: &ObjectRef) -> CycleScan {
        self.scan_roots(std::slice::from_ref(root))
    }

    /// Walk from every root with shared visited sets, so a cycle reachable
    /// from several roots is reported once.
    pub fn scan_roots(&self, roots: &[ObjectRef]) -> CycleScan {
        let Some(enumerator) = self.enumerator.as_deref() else {
            return CycleScan::unsupported();
        };
        let _walk = self.walk.lock();
        let config = self.config.read().clone();
        let detected_at_ms = self.clock.epoch_ms();

        let mut state = WalkState::default();
        for root in roots {
            enter(&mut state, enumerator, &config, root.clone(), None, detected_at_ms);
            loop {
                let Some(top) = state.path.last_mut() else {
                    break;
                };
                if let Some(child) = top.children.next() {
                    enter(
                        &mut state,
                        enumerator,
                        &config,
                        child.target,
                        child.label,
                        detected_at_ms,
                    );
                } else if let Some(done) = state.path.pop() {
                    let id = done.node.id();
                    state.on_path.remove(&id);
                    state.fully_explored.insert(id);
                }
            }
        }

        let status = if state.truncated.is_empty() {
            ScanStatus::Complete
        } else {
            ScanStatus::Truncated
        };
        for cycle in &state.cycles {
            warn!(
                subsystem = "graph",
                length = cycle.length,
                path = %cycle.describe(),
                "Reference cycle detected"
            );
            self.history.push(cycle.clone());
            self.bus.publish(Finding::CycleFound(cycle.clone()));
        }
        debug!(
            subsystem = "graph",
            roots = roots.len(),
            visited = state.fully_explored.len(),
            cycles = state.cycles.len(),
            truncated = state.truncated.len(),
            "Reference walk complete"
        );

        CycleScan {
            status,
            nodes_visited: state.fully_explored.len(),
            opaque_nodes: state.opaque,
            truncated_nodes: state.truncated,
            cycles: state.cycles,
        }
    }

    /// Recently detected cycles, oldest first.
    #[must_use]
    pub fn recent_cycles(&self) -> Vec<CycleReport> {
        self.history.snapshot()
    }

    pub fn clear(&self) {
        self.history.clear();
    }

    #[must_use]
    pub fn config(&self) -> GraphConfig {
        self.config.read().clone()
    }

    /// Validate `config` as a replacement for the current one.
    pub fn check_update(&self, config: &GraphConfig) -> Result<(), ConfigError> {
        config.validate()?;
        ensure_fixed_capacity(
            "graph.history_capacity",
            self.history.capacity(),
            config.history_capacity,
        )
    }

    /// Replace budgets. `history_capacity` must stay as constructed.
    pub fn configure(&self, config: GraphConfig) -> Result<(), ConfigError> {
        self.check_update(&config)?;
        *self.config.write() = config;
        Ok(())
    }
}

impl std::fmt::Debug for ReferenceGraphWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceGraphWalker")
            .field("supported", &self.is_supported())
            .field("recent_cycles", &self.history.len())
            .finish_non_exhaustive()
    }
}

fn node_of(object: &ObjectRef) -> GraphNode {
    GraphNode {
        id: object.id(),
        class_name: object.class_name.clone(),
    }
}

fn enter(
    state: &mut WalkState,
    enumerator: &dyn ReferenceEnumerator,
    config: &GraphConfig,
    object: ObjectRef,
    via: Option<String>,
    detected_at_ms: u64,
) {
    let id = object.id();

    if let Some(&start) = state.on_path.get(&id) {
        let loop_entries = &state.path[start..];
        let objects: Vec<GraphNode> = loop_entries.iter().map(|e| node_of(&e.node)).collect();
        let mut edges: Vec<GraphEdge> = loop_entries
            .windows(2)
            .map(|pair| GraphEdge {
                from_id: pair[0].node.id(),
                to_id: pair[1].node.id(),
                label: pair[1].via.clone(),
            })
            .collect();
        if let Some(last) = loop_entries.last() {
            edges.push(GraphEdge {
                from_id: last.node.id(),
                to_id: id,
                label: via,
            });
        }
        state.cycles.push(CycleReport {
            length: objects.len(),
            objects,
            edges,
            detected_at_ms,
        });
        return;
    }
    if state.fully_explored.contains(&id) {
        return;
    }
    if state.path.len() >= config.max_depth
        || state.fully_explored.len() + state.path.len() >= config.max_nodes
    {
        state.truncated.push(node_of(&object));
        return;
    }

    let children = enumerator.outgoing_references(&object).unwrap_or_else(|| {
        state.opaque += 1;
        Vec::new()
    });
    state.keepalive.push(object.clone());
    state.on_path.insert(id, state.path.len());
    state.path.push(PathEntry {
        node: object,
        via,
        children: children.into_iter(),
    });
}
