//! Postorder numbering, the dominator tree and retained sizes.
//!
//! Only essential edges count: weak edges never retain, and shortcut edges
//! only retain when they leave the root. When the policy marks user objects,
//! a user object is not entered from a non-user node other than the root.

use tracing::warn;

use crate::graph::{ProblemReport, SnapshotGraph};

fn is_user_object(graph: &SnapshotGraph, ordinal: usize, flag: u8) -> bool {
    graph.flags(ordinal) & flag != 0
}

// ============================================================================
// Postorder
// ============================================================================

/// Bijection between node ordinals and DFS postorder positions. The root is
/// always last.
#[derive(Debug, Clone)]
pub struct PostOrder {
    pub index_to_ordinal: Vec<u32>,
    pub ordinal_to_index: Vec<u32>,
    pub reports: Vec<ProblemReport>,
}

struct Frame {
    ordinal: usize,
    next_edge: usize,
}

/// Depth-first postorder over essential edges from the root.
///
/// Nodes the first pass misses are retried from the ones whose retainers are
/// all weak or shortcut edges; anything still missing is placed just before
/// the root, which makes it a direct child of the root in the dominator tree.
pub fn build_post_order(graph: &SnapshotGraph, user_flag: u8) -> PostOrder {
    let node_count = graph.node_count();
    let root = graph.root_ordinal();
    let edge_fields = graph.edge_field_count();
    let mut index_to_ordinal = vec![0u32; node_count];
    let mut ordinal_to_index = vec![0u32; node_count];
    let mut visited = vec![false; node_count];
    let mut reports = Vec::new();
    let mut post_order_index = 0usize;

    let mut stack = vec![Frame {
        ordinal: root,
        next_edge: graph.first_edge_index(root),
    }];
    visited[root] = true;

    let mut iteration = 0;
    loop {
        iteration += 1;
        while let Some(frame) = stack.last_mut() {
            let ordinal = frame.ordinal;
            let end = graph.first_edge_index(ordinal + 1);
            if frame.next_edge < end {
                let edge = graph.edge(frame.next_edge);
                frame.next_edge += edge_fields;
                let node_index = graph.index_of(ordinal);
                if !graph.is_essential_edge(node_index, edge.type_id()) {
                    continue;
                }
                let child = edge.target().ordinal();
                if visited[child] {
                    continue;
                }
                if ordinal != root
                    && is_user_object(graph, child, user_flag)
                    && !is_user_object(graph, ordinal, user_flag)
                {
                    continue;
                }
                visited[child] = true;
                stack.push(Frame {
                    ordinal: child,
                    next_edge: graph.first_edge_index(child),
                });
            } else {
                ordinal_to_index[ordinal] = post_order_index as u32;
                index_to_ordinal[post_order_index] = ordinal as u32;
                post_order_index += 1;
                stack.pop();
            }
        }

        if post_order_index == node_count || iteration > 1 {
            break;
        }

        let mut report = ProblemReport::new(format!(
            "Heap snapshot: {} nodes are unreachable from the root. Following nodes have only weak retainers:",
            node_count - post_order_index
        ));
        // Take the root back out and revisit it after the orphans' subgraphs.
        post_order_index -= 1;
        stack.push(Frame {
            ordinal: root,
            next_edge: graph.first_edge_index(root + 1),
        });
        for ordinal in 0..node_count {
            if visited[ordinal] || !graph.has_only_weak_retainers(ordinal) {
                continue;
            }
            visited[ordinal] = true;
            stack.push(Frame {
                ordinal,
                next_edge: graph.first_edge_index(ordinal),
            });
            let node = graph.node_by_ordinal(ordinal);
            let retainers: Vec<String> = node
                .retainers()
                .map(|r| format!("{}@{}.{}", r.node.name(), r.node.id(), r.edge.name()))
                .collect();
            report.add(format!(
                "{} @{}  weak retainers: {}",
                node.name(),
                node.id(),
                retainers.join(", ")
            ));
        }
        warn!("{}", report);
        reports.push(report);
    }

    if post_order_index != node_count {
        let mut report = ProblemReport::new(format!(
            "Still found {} unreachable nodes in heap snapshot:",
            node_count - post_order_index
        ));
        post_order_index -= 1;
        for ordinal in 0..node_count {
            if visited[ordinal] {
                continue;
            }
            let node = graph.node_by_ordinal(ordinal);
            report.add(format!("{} @{}", node.name(), node.id()));
            ordinal_to_index[ordinal] = post_order_index as u32;
            index_to_ordinal[post_order_index] = ordinal as u32;
            post_order_index += 1;
        }
        ordinal_to_index[root] = post_order_index as u32;
        index_to_ordinal[post_order_index] = root as u32;
        warn!("{}", report);
        reports.push(report);
    }

    PostOrder {
        index_to_ordinal,
        ordinal_to_index,
        reports,
    }
}

// ============================================================================
// Dominator tree
// ============================================================================

/// Computes the immediate dominator ordinal of every node ordinal.
pub fn build_dominator_tree(graph: &SnapshotGraph, post_order: &PostOrder, user_flag: u8) -> Vec<u32> {
    let node_count = post_order.index_to_ordinal.len();
    let root_post_index = node_count - 1;
    let no_entry = node_count;
    let root_index = graph.root_index();
    let to_post = |ordinal: usize| post_order.ordinal_to_index[ordinal] as usize;

    let mut dominators = vec![no_entry; node_count];
    dominators[root_post_index] = root_post_index;

    // Every pass revisits all nodes: a changed dominator can shorten the
    // chain of any node below it, not only of its direct successors.
    let mut changed = true;
    while changed {
        changed = false;
        for post_index in (0..root_post_index).rev() {
            // A node dominated by the root cannot move any higher.
            if dominators[post_index] == root_post_index {
                continue;
            }
            let ordinal = post_order.index_to_ordinal[post_index] as usize;
            let node_is_user = is_user_object(graph, ordinal, user_flag);
            let mut new_dominator = no_entry;
            let mut orphan = true;
            for slot in graph.retainer_slots(ordinal) {
                let retainer = graph.retainer(slot);
                let retainer_index = retainer.node.index();
                if !graph.is_essential_edge(retainer_index, retainer.edge.type_id()) {
                    continue;
                }
                orphan = false;
                let retainer_ordinal = retainer.node.ordinal();
                if retainer_index != root_index
                    && node_is_user
                    && !is_user_object(graph, retainer_ordinal, user_flag)
                {
                    continue;
                }
                let retainer_post = to_post(retainer_ordinal);
                if dominators[retainer_post] == no_entry {
                    continue;
                }
                new_dominator = if new_dominator == no_entry {
                    retainer_post
                } else {
                    intersect(&dominators, retainer_post, new_dominator, root_post_index)
                };
                if new_dominator == root_post_index {
                    break;
                }
            }
            if orphan {
                new_dominator = root_post_index;
            }
            if new_dominator != no_entry && dominators[post_index] != new_dominator {
                dominators[post_index] = new_dominator;
                changed = true;
            }
        }
    }

    let mut tree = vec![0u32; node_count];
    for (post_index, &dominator) in dominators.iter().enumerate() {
        let ordinal = post_order.index_to_ordinal[post_index] as usize;
        // Only nodes the fixpoint never reached remain unset.
        let dominator = if dominator == no_entry {
            root_post_index
        } else {
            dominator
        };
        tree[ordinal] = post_order.index_to_ordinal[dominator];
    }
    tree
}

/// Nearest common ancestor of two postorder positions, walking up whichever
/// is lower.
fn intersect(dominators: &[usize], mut a: usize, mut b: usize, root: usize) -> usize {
    let up = |x: usize| {
        let next = dominators[x];
        if next <= x { root } else { next }
    };
    while a != b {
        while a < b {
            a = up(a);
        }
        while b < a {
            b = up(b);
        }
    }
    a
}

// ============================================================================
// Retained sizes
// ============================================================================

/// Self size plus the retained sizes of all dominated nodes, per ordinal.
pub fn calculate_retained_sizes(
    graph: &SnapshotGraph,
    post_order: &PostOrder,
    dominators: &[u32],
) -> Vec<f64> {
    let mut retained: Vec<f64> = graph.nodes().map(|n| f64::from(n.self_size())).collect();
    let node_count = graph.node_count();
    for &ordinal in &post_order.index_to_ordinal[..node_count - 1] {
        let ordinal = ordinal as usize;
        retained[dominators[ordinal] as usize] += retained[ordinal];
    }
    retained
}

/// Children of each node in the dominator tree, as node indexes.
#[derive(Debug, Clone)]
pub struct DominatedNodes {
    first: Vec<u32>,
    nodes: Vec<u32>,
}

impl DominatedNodes {
    pub fn new(graph: &SnapshotGraph, dominators: &[u32]) -> Self {
        let node_count = graph.node_count();
        let root = graph.root_ordinal();
        let mut first = vec![0u32; node_count + 1];
        for (ordinal, &dominator) in dominators.iter().enumerate() {
            if ordinal != root {
                first[dominator as usize] += 1;
            }
        }
        let mut offset = 0u32;
        for slot in first.iter_mut() {
            let count = *slot;
            *slot = offset;
            offset += count;
        }
        let mut cursor = first.clone();
        let mut nodes = vec![0u32; offset as usize];
        for (ordinal, &dominator) in dominators.iter().enumerate() {
            if ordinal == root {
                continue;
            }
            let slot = &mut cursor[dominator as usize];
            nodes[*slot as usize] = graph.index_of(ordinal) as u32;
            *slot += 1;
        }
        DominatedNodes { first, nodes }
    }

    /// Node indexes immediately dominated by `ordinal`.
    pub fn of(&self, ordinal: usize) -> &[u32] {
        &self.nodes[self.first[ordinal] as usize..self.first[ordinal + 1] as usize]
    }
}
