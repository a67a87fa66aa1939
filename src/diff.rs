//! Snapshot-to-snapshot diff by class.
//!
//! Both sides are id-sorted member lists, so each class is diffed with a
//! single linear merge. Object ids are stable across snapshots of the same
//! heap, which is what makes the comparison meaningful.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregates::Aggregates;
use crate::graph::SnapshotGraph;
use crate::snapshot::SnapshotDiff;

/// One class of the base snapshot, as the target snapshot needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateForDiff {
    /// Node indexes in the base snapshot, ordered by id.
    pub indexes: Vec<u32>,
    pub ids: Vec<u32>,
    pub self_sizes: Vec<u32>,
}

impl AggregateForDiff {
    /// Gathers ids and sizes for id-sorted member indexes.
    pub fn from_indexes(graph: &SnapshotGraph, indexes: &[u32]) -> Self {
        let mut ids = Vec::with_capacity(indexes.len());
        let mut self_sizes = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let node = graph.node(index as usize);
            ids.push(node.id());
            self_sizes.push(node.self_size());
        }
        AggregateForDiff {
            indexes: indexes.to_vec(),
            ids,
            self_sizes,
        }
    }
}

/// Objects of one class that appeared or disappeared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDiff {
    pub name: String,
    pub added_count: u32,
    pub removed_count: u32,
    pub added_size: u64,
    pub removed_size: u64,
    /// Node indexes in the base snapshot.
    pub deleted_indexes: Vec<u32>,
    /// Node indexes in the target snapshot.
    pub added_indexes: Vec<u32>,
    pub count_delta: i64,
    pub size_delta: i64,
}

/// Merges an id-sorted base class against id-sorted target members.
/// Returns `None` when nothing was added or removed.
pub fn diff_class(
    graph: &SnapshotGraph,
    name: &str,
    base: &AggregateForDiff,
    indexes: &[u32],
) -> Option<ClassDiff> {
    let mut diff = ClassDiff {
        name: name.to_string(),
        ..ClassDiff::default()
    };
    let (mut i, mut j) = (0, 0);
    let remove = |diff: &mut ClassDiff, i: usize| {
        diff.deleted_indexes.push(base.indexes[i]);
        diff.removed_count += 1;
        diff.removed_size += u64::from(base.self_sizes[i]);
    };
    let add = |diff: &mut ClassDiff, index: u32| {
        diff.added_indexes.push(index);
        diff.added_count += 1;
        diff.added_size += u64::from(graph.node(index as usize).self_size());
    };

    while i < base.ids.len() && j < indexes.len() {
        let base_id = base.ids[i];
        let target_id = graph.node(indexes[j] as usize).id();
        if base_id < target_id {
            remove(&mut diff, i);
            i += 1;
        } else if base_id > target_id {
            add(&mut diff, indexes[j]);
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    while i < base.ids.len() {
        remove(&mut diff, i);
        i += 1;
    }
    while j < indexes.len() {
        add(&mut diff, indexes[j]);
        j += 1;
    }

    if diff.added_count == 0 && diff.removed_count == 0 {
        return None;
    }
    diff.count_delta = i64::from(diff.added_count) - i64::from(diff.removed_count);
    diff.size_delta = diff.added_size as i64 - diff.removed_size as i64;
    Some(diff)
}

/// Diffs every class of the base and every class only the target has.
pub fn calculate_snapshot_diff(
    graph: &SnapshotGraph,
    base: &HashMap<String, AggregateForDiff>,
    target: &Aggregates,
) -> SnapshotDiff {
    let mut result = SnapshotDiff::new();
    for (name, base_aggregate) in base {
        let indexes = target
            .classes
            .get(name)
            .map(|a| a.idxs.as_slice())
            .unwrap_or(&[]);
        if let Some(diff) = diff_class(graph, name, base_aggregate, indexes) {
            result.insert(name.clone(), diff);
        }
    }
    let empty = AggregateForDiff::default();
    for (name, aggregate) in &target.classes {
        if base.contains_key(name) {
            continue;
        }
        if let Some(diff) = diff_class(graph, name, &empty, &aggregate.idxs) {
            result.insert(name.clone(), diff);
        }
    }
    result
}
