//! Property-based tests for reference-cycle detection.
//!
//! Covers: no false cycles on random DAGs, exactly one cycle per ring, and
//! depth-budget truncation never inventing cycles.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use perfsentry_core::clock::ManualClock;
use perfsentry_core::events::FindingBus;
use perfsentry_core::graph::{
    GraphConfig, ObjectRef, OutgoingRef, ReferenceEnumerator, ReferenceGraphWalker,
    ReferenceRegistry, ScanStatus,
};

// =============================================================================
// Fixtures
// =============================================================================

struct Vertex {
    edges: Mutex<Vec<Arc<Vertex>>>,
}

fn vertices(n: usize) -> Vec<Arc<Vertex>> {
    (0..n)
        .map(|_| {
            Arc::new(Vertex {
                edges: Mutex::new(Vec::new()),
            })
        })
        .collect()
}

fn connect(from: &Arc<Vertex>, to: &Arc<Vertex>) {
    from.edges.lock().unwrap().push(Arc::clone(to));
}

fn disconnect(all: &[Arc<Vertex>]) {
    for v in all {
        v.edges.lock().unwrap().clear();
    }
}

fn walker(config: GraphConfig) -> ReferenceGraphWalker {
    let registry = ReferenceRegistry::new();
    registry.register::<Vertex, _>(|v| {
        v.edges
            .lock()
            .unwrap()
            .iter()
            .map(OutgoingRef::new)
            .collect()
    });
    let enumerator: Arc<dyn ReferenceEnumerator> = Arc::new(registry);
    ReferenceGraphWalker::new(
        config,
        Some(enumerator),
        Arc::new(ManualClock::default()),
        FindingBus::default(),
    )
}

/// Edges (i, j) with i < j over `n` vertices: always acyclic.
fn arb_dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..24).prop_flat_map(|n| {
        let edge = (0..n, 0..n).prop_filter_map("forward edge", |(a, b)| {
            (a != b).then(|| (a.min(b), a.max(b)))
        });
        (Just(n), prop::collection::vec(edge, 0..64))
    })
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A DAG never yields a cycle, from any set of roots.
    #[test]
    fn prop_dag_has_no_cycles((n, edges) in arb_dag()) {
        let all = vertices(n);
        for (a, b) in &edges {
            connect(&all[*a], &all[*b]);
        }
        let roots: Vec<ObjectRef> = all.iter().map(ObjectRef::new).collect();
        let scan = walker(GraphConfig::default()).scan_roots(&roots);
        disconnect(&all);

        prop_assert_eq!(scan.status, ScanStatus::Complete);
        prop_assert!(scan.cycles.is_empty());
        prop_assert_eq!(scan.nodes_visited, n);
    }

    /// A ring of n vertices is exactly one cycle of length n.
    #[test]
    fn prop_ring_is_one_cycle(n in 1usize..40) {
        let all = vertices(n);
        for i in 0..n {
            connect(&all[i], &all[(i + 1) % n]);
        }
        let scan = walker(GraphConfig::default()).scan(&ObjectRef::new(&all[0]));
        disconnect(&all);

        prop_assert_eq!(scan.cycles.len(), 1);
        prop_assert_eq!(scan.cycles[0].length, n);
        prop_assert_eq!(scan.cycles[0].edges.len(), n);
        prop_assert_eq!(scan.cycles[0].objects[0].id, ObjectRef::new(&all[0]).id());
    }

    /// Cutting a long chain short reports truncation, never a cycle.
    #[test]
    fn prop_depth_cap_truncates_chains(n in 2usize..60, max_depth in 1usize..20) {
        let all = vertices(n);
        for pair in all.windows(2) {
            connect(&pair[0], &pair[1]);
        }
        let config = GraphConfig { max_depth, ..GraphConfig::default() };
        let scan = walker(config).scan(&ObjectRef::new(&all[0]));
        disconnect(&all);

        prop_assert!(scan.cycles.is_empty());
        if n > max_depth {
            prop_assert_eq!(scan.status, ScanStatus::Truncated);
            prop_assert_eq!(scan.nodes_visited, max_depth);
        } else {
            prop_assert_eq!(scan.status, ScanStatus::Complete);
        }
    }
}
