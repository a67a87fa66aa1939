//! Per-class aggregation of snapshot nodes.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::graph::{Node, SnapshotGraph};
use crate::snapshot::HeapSnapshot;

/// Restricts an analysis to a subset of nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeFilter {
    /// Exclusive lower bound on node ids.
    pub min_node_id: Option<u32>,
    /// Inclusive upper bound on node ids.
    pub max_node_id: Option<u32>,
    /// Bottom-up allocation node whose trace tops the nodes must come from.
    pub allocation_node_id: Option<u32>,
}

impl NodeFilter {
    /// Cache key; equal filters share aggregates.
    pub fn key(&self) -> String {
        if let Some(id) = self.allocation_node_id {
            return format!("allocationNodeId: {}", id);
        }
        match (self.min_node_id, self.max_node_id) {
            (None, None) => "allObjects".to_string(),
            (min, max) => format!(
                "{}..{}",
                min.unwrap_or(0),
                max.unwrap_or(u32::MAX)
            ),
        }
    }
}

/// A resolved [`NodeFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePredicate {
    All,
    /// `min < id <= max`.
    IdRange { min: u32, max: u32 },
    /// Trace node id is one of these.
    TraceIds(HashSet<u32>),
}

impl NodePredicate {
    pub fn matches(&self, node: Node<'_>) -> bool {
        match self {
            NodePredicate::All => true,
            NodePredicate::IdRange { min, max } => {
                let id = node.id();
                id > *min && id <= *max
            }
            NodePredicate::TraceIds(ids) => ids.contains(&node.trace_node_id()),
        }
    }
}

/// Summary of all nodes of one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub name: String,
    pub count: u32,
    /// Smallest distance among the members.
    pub distance: i32,
    #[serde(rename = "self")]
    pub self_size: f64,
    /// Retained size of the class, counting nested members once.
    pub max_ret: f64,
    /// Member node indexes.
    pub idxs: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    pub classes: BTreeMap<String, Aggregate>,
    /// Whether every member list is ordered by node id.
    #[serde(skip)]
    pub sorted_by_id: bool,
}

impl Aggregates {
    /// Stable sort of every member list by node id.
    pub fn sort_by_id(&mut self, graph: &SnapshotGraph) {
        for aggregate in self.classes.values_mut() {
            aggregate.idxs.sort_by_key(|&index| graph.node(index as usize).id());
        }
        self.sorted_by_id = true;
    }

    pub fn total_count(&self) -> u64 {
        self.classes.values().map(|a| u64::from(a.count)).sum()
    }

    pub fn total_self_size(&self) -> f64 {
        self.classes.values().map(|a| a.self_size).sum()
    }
}

const NO_CLASS: u32 = u32::MAX;

/// Groups the nodes passing `predicate` and the policy's node filter by
/// class. Nodes of zero self size are skipped unless they are native.
pub fn build_aggregates(snapshot: &HeapSnapshot, predicate: &NodePredicate) -> Aggregates {
    let graph = snapshot.graph();
    let policy = snapshot.policy();
    let native = graph.node_types().native;

    let mut slots: HashMap<String, u32> = HashMap::new();
    let mut list: Vec<Aggregate> = Vec::new();
    let mut class_of = vec![NO_CLASS; graph.node_count()];

    for node in graph.nodes() {
        if !policy.node_filter(node) || !predicate.matches(node) {
            continue;
        }
        let self_size = node.self_size();
        if self_size == 0 && !node.is_type(native) {
            continue;
        }
        let distance = snapshot.distance(node.ordinal());
        let name = policy.class_name(node);
        let slot = match slots.get(name.as_ref()) {
            Some(&slot) => slot,
            None => {
                let slot = list.len() as u32;
                slots.insert(name.to_string(), slot);
                list.push(Aggregate {
                    name: name.into_owned(),
                    count: 0,
                    distance,
                    self_size: 0.0,
                    max_ret: 0.0,
                    idxs: Vec::new(),
                });
                slot
            }
        };
        let aggregate = &mut list[slot as usize];
        aggregate.count += 1;
        aggregate.distance = aggregate.distance.min(distance);
        aggregate.self_size += f64::from(self_size);
        aggregate.idxs.push(node.index() as u32);
        class_of[node.ordinal()] = slot;
    }

    calculate_classes_retained_size(snapshot, &class_of, &mut list);

    Aggregates {
        classes: list.into_iter().map(|a| (a.name.clone(), a)).collect(),
        sorted_by_id: false,
    }
}

/// Walks the dominator tree from the root and credits each class with the
/// retained size of its outermost members. A class is marked seen while the
/// walk is inside the subtree of one of its members, so nested members do
/// not count twice; siblings are credited separately.
fn calculate_classes_retained_size(
    snapshot: &HeapSnapshot,
    class_of: &[u32],
    list: &mut [Aggregate],
) {
    let graph = snapshot.graph();
    let mut seen = vec![false; list.len()];
    let mut stack: Vec<u32> = vec![graph.root_index() as u32];
    // Stack heights at which a seen class leaves scope, and those classes.
    let mut sizes: Vec<usize> = Vec::new();
    let mut classes: Vec<u32> = Vec::new();

    while let Some(index) = stack.pop() {
        let ordinal = graph.ordinal_of(index as usize);
        let slot = class_of[ordinal];
        let dominated = snapshot.dominated_nodes(ordinal);
        if slot != NO_CLASS && !seen[slot as usize] {
            list[slot as usize].max_ret += snapshot.retained_size(ordinal);
            if !dominated.is_empty() {
                seen[slot as usize] = true;
                sizes.push(stack.len());
                classes.push(slot);
            }
        }
        stack.extend_from_slice(dominated);
        let height = stack.len();
        while sizes.last() == Some(&height) {
            sizes.pop();
            if let Some(slot) = classes.pop() {
                seen[slot as usize] = false;
            }
        }
    }
}
