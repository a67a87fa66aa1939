//! Breadth-first reachability distance from the snapshot roots.
//!
//! Two passes share one queue: user roots (per policy) are seeded at
//! distance 1 first, then the root itself is seeded at the system distance
//! so everything reachable only through engine internals lands far away.
//! A node's distance is set at most once; the earlier pass wins.

use tracing::debug;

use crate::graph::SnapshotGraph;
use crate::policy::SnapshotPolicy;
use crate::snapshot::SnapshotError;

/// Distance of a node reached by neither the user-root nor the system-root
/// pass; such nodes are unreachable.
pub const NO_DISTANCE: i32 = -5;

/// Computes the per-ordinal distance array.
pub fn calculate_distances(
    graph: &SnapshotGraph,
    policy: &dyn SnapshotPolicy,
) -> Result<Vec<i32>, SnapshotError> {
    let node_count = graph.node_count();
    let mut distances = vec![NO_DISTANCE; node_count];
    let mut queue = BfsQueue::new(node_count);

    for edge in graph.root().edges() {
        let node = edge.target();
        if node.is_root() || distances[node.ordinal()] != NO_DISTANCE {
            continue;
        }
        if policy.is_user_root(node) {
            distances[node.ordinal()] = 1;
            queue.push(node.ordinal())?;
        }
    }
    let user_seeds = queue.len();
    bfs(graph, policy, &mut queue, &mut distances)?;
    let reached = queue.len();

    let root = graph.root_ordinal();
    distances[root] = if reached > 0 { policy.system_distance() } else { 0 };
    queue.reset();
    queue.push(root)?;
    bfs(graph, policy, &mut queue, &mut distances)?;

    debug!(
        user_roots = user_seeds,
        user_reachable = reached,
        system_reachable = queue.len(),
        "distances computed"
    );
    Ok(distances)
}

fn bfs(
    graph: &SnapshotGraph,
    policy: &dyn SnapshotPolicy,
    queue: &mut BfsQueue,
    distances: &mut [i32],
) -> Result<(), SnapshotError> {
    while let Some(ordinal) = queue.pop() {
        let node = graph.node_by_ordinal(ordinal);
        let distance = distances[ordinal] + 1;
        for edge in node.edges() {
            if edge.is_weak() {
                continue;
            }
            let child = edge.target().ordinal();
            if distances[child] != NO_DISTANCE {
                continue;
            }
            if !policy.distance_filter(node, edge) {
                continue;
            }
            distances[child] = distance;
            queue.push(child)?;
        }
    }
    Ok(())
}

/// Preallocated FIFO of ordinals. Exceeding the node count means a node
/// was enqueued twice.
struct BfsQueue {
    items: Vec<usize>,
    head: usize,
    capacity: usize,
}

impl BfsQueue {
    fn new(capacity: usize) -> Self {
        BfsQueue {
            items: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    fn push(&mut self, ordinal: usize) -> Result<(), SnapshotError> {
        if self.items.len() >= self.capacity {
            return Err(SnapshotError::BfsOverflow {
                enqueued: self.items.len() + 1,
                node_count: self.capacity,
            });
        }
        self.items.push(ordinal);
        Ok(())
    }

    fn pop(&mut self) -> Option<usize> {
        let item = self.items.get(self.head).copied()?;
        self.head += 1;
        Some(item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn reset(&mut self) {
        self.items.clear();
        self.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BASE_SYSTEM_DISTANCE, JsHeapPolicy};
    use crate::testing::{SnapshotBuilder, diamond};

    #[test]
    fn diamond_distances() {
        let snapshot = diamond().build();
        let distances = snapshot.distances();
        assert_eq!(distances[1], 1);
        assert_eq!(distances[2], 1);
        assert_eq!(distances[3], 2);
        assert_eq!(distances[0], BASE_SYSTEM_DISTANCE);
    }

    #[test]
    fn weak_only_node_stays_unvisited() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let a = b.node("object", "A", 3, 10);
        let cached = b.node("object", "Cached", 5, 10);
        b.edge(root, "element", "1", a);
        b.edge(a, "weak", "cache", cached);
        let snapshot = b.build();
        assert_eq!(snapshot.distances()[cached], NO_DISTANCE);
        assert_eq!(snapshot.distances()[a], 1);
    }

    #[test]
    fn system_pass_does_not_override_user_pass() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let gc_roots = b.node("synthetic", "(GC roots)", 3, 0);
        let window = b.node("object", "Window", 5, 40);
        let shared = b.node("object", "Shared", 7, 8);
        let internal = b.node("hidden", "system / Foo", 9, 8);
        b.edge(root, "element", "1", gc_roots);
        b.edge(root, "shortcut", "window", window);
        b.edge(gc_roots, "element", "1", shared);
        b.edge(gc_roots, "element", "2", internal);
        b.edge(window, "property", "shared", shared);
        let snapshot = b.build_with(Box::new(JsHeapPolicy::default()));
        let distances = snapshot.distances();
        assert_eq!(distances[window], 1);
        assert_eq!(distances[shared], 2);
        assert_eq!(distances[gc_roots], BASE_SYSTEM_DISTANCE + 1);
        assert_eq!(distances[internal], BASE_SYSTEM_DISTANCE + 2);
    }

    #[test]
    fn root_is_zero_without_user_roots() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let gc_roots = b.node("synthetic", "(GC roots)", 3, 0);
        b.edge(root, "element", "1", gc_roots);
        let snapshot = b.build_with(Box::new(JsHeapPolicy::default()));
        assert_eq!(snapshot.distances()[root], 0);
        assert_eq!(snapshot.distances()[gc_roots], 1);
    }

    #[test]
    fn queue_overflow_is_an_error() {
        let mut queue = BfsQueue::new(1);
        queue.push(0).unwrap();
        let err = queue.push(0).unwrap_err();
        assert!(matches!(err, SnapshotError::BfsOverflow { node_count: 1, .. }));
    }
}
