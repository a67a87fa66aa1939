//! Allocation profile built from the snapshot's allocation traces.
//!
//! The raw `trace_tree` is a top-down call tree: every node is one call
//! stack with the number and size of allocations made exactly there.
//! Functions are summarised across all their call sites, and for each
//! function a bottom-up caller tree is built the first time it is asked for.
//!
//! Serialized nodes get ids from a single counter. Expanding a node hands
//! out fresh ids for its callers, so ids are only meaningful to the profile
//! that issued them.

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::graph::SnapshotGraph;
use crate::loader::{TraceItem, TraceTree};
use crate::meta::{FunctionInfoLayout, SnapshotFieldMeta, TraceNodeLayout};
use crate::snapshot::{Result, SnapshotError};

/// One row of the allocation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedAllocationNode {
    pub id: u32,
    pub name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
    pub count: u64,
    pub size: u64,
    pub live_count: u64,
    pub live_size: u64,
    pub has_children: bool,
}

/// Callers of an expanded node: the chain while there is exactly one
/// caller, then the callers where it branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationNodeCallers {
    pub nodes_with_single_caller: Vec<SerializedAllocationNode>,
    pub branching_callers: Vec<SerializedAllocationNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStackFrame {
    pub function_name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct LiveStats {
    count: u64,
    size: u64,
}

struct FunctionInfo {
    name: String,
    script_name: String,
    script_id: u32,
    line: u32,
    column: u32,
    total_count: u64,
    total_size: u64,
    total_live_count: u64,
    total_live_size: u64,
    /// Top-down nodes of this function that allocated something.
    trace_tops: Vec<usize>,
    bottom_up: OnceCell<BottomUpTree>,
}

struct TopDownNode {
    id: u32,
    function_info: usize,
    allocation_count: u64,
    allocation_size: u64,
    live_count: u64,
    live_size: u64,
    parent: Option<usize>,
    children: Vec<usize>,
}

struct BottomUpNode {
    function_info: usize,
    allocation_count: u64,
    allocation_size: u64,
    live_count: u64,
    live_size: u64,
    trace_top_ids: Vec<u32>,
    callers: Vec<usize>,
}

impl BottomUpNode {
    fn new(function_info: usize) -> Self {
        BottomUpNode {
            function_info,
            allocation_count: 0,
            allocation_size: 0,
            live_count: 0,
            live_size: 0,
            trace_top_ids: Vec::new(),
            callers: Vec::new(),
        }
    }
}

/// Caller tree of one function; node 0 is the function itself.
struct BottomUpTree {
    nodes: Vec<BottomUpNode>,
}

impl BottomUpTree {
    /// Caller of `node` for `function_info`, created on first use.
    fn add_caller(&mut self, node: usize, function_info: usize) -> usize {
        let existing = self.nodes[node]
            .callers
            .iter()
            .copied()
            .find(|&caller| self.nodes[caller].function_info == function_info);
        if let Some(caller) = existing {
            return caller;
        }
        let caller = self.nodes.len();
        self.nodes.push(BottomUpNode::new(function_info));
        self.nodes[node].callers.push(caller);
        caller
    }
}

#[derive(Default)]
struct SerializationState {
    next_node_id: u32,
    trace_tops: Option<Vec<SerializedAllocationNode>>,
    /// Summary node ids not yet expanded, by function info.
    collapsed: HashMap<u32, usize>,
    /// Expanded node ids: function info owning the tree, node in the tree.
    id_to_node: HashMap<u32, (usize, usize)>,
}

pub struct AllocationProfile {
    function_infos: Vec<FunctionInfo>,
    top_down: Vec<TopDownNode>,
    id_to_top_down: HashMap<u32, usize>,
    state: RefCell<SerializationState>,
}

impl AllocationProfile {
    pub fn new(
        meta: &SnapshotFieldMeta,
        graph: &SnapshotGraph,
        raw_infos: &[u32],
        trace_tree: &TraceTree,
    ) -> Result<Self> {
        let mut profile = AllocationProfile {
            function_infos: build_function_infos(meta, graph, raw_infos)?,
            top_down: Vec::new(),
            id_to_top_down: HashMap::new(),
            state: RefCell::new(SerializationState {
                next_node_id: 1,
                ..SerializationState::default()
            }),
        };
        profile.build_top_down(meta, &live_object_stats(graph), trace_tree)?;
        debug!(
            functions = profile.function_infos.len(),
            trace_nodes = profile.top_down.len(),
            "allocation profile built"
        );
        Ok(profile)
    }

    fn build_top_down(
        &mut self,
        meta: &SnapshotFieldMeta,
        live: &HashMap<u32, LiveStats>,
        tree: &TraceTree,
    ) -> Result<()> {
        if tree.is_empty() {
            return Ok(());
        }
        let layout = TraceNodeLayout::new(meta)?;
        let width = layout.field_count;
        // (array, offset of the record in it, parent)
        let mut stack: Vec<(usize, usize, Option<usize>)> = vec![(0, 0, None)];
        while let Some((array, offset, parent)) = stack.pop() {
            let record = tree
                .array(array)
                .get(offset..offset + width)
                .ok_or_else(|| invalid(format!("record cut short in array {}", array)))?;
            let id = number(record[layout.id_offset])?;
            let function_info = number(record[layout.function_info_index_offset])? as usize;
            if function_info >= self.function_infos.len() {
                return Err(invalid(format!(
                    "trace node {} refers to function {}",
                    id, function_info
                )));
            }
            let TraceItem::Array(children) = record[layout.children_offset] else {
                return Err(invalid(format!("trace node {} has no children array", id)));
            };
            let stats = live.get(&id).copied().unwrap_or_default();
            let index = self.top_down.len();
            self.top_down.push(TopDownNode {
                id,
                function_info,
                allocation_count: u64::from(number(record[layout.count_offset])?),
                allocation_size: u64::from(number(record[layout.size_offset])?),
                live_count: stats.count,
                live_size: stats.size,
                parent,
                children: Vec::new(),
            });
            self.id_to_top_down.insert(id, index);
            if let Some(parent) = parent {
                self.top_down[parent].children.push(index);
            }
            self.add_trace_top(index);

            let child_items = tree.array(children).len();
            if child_items % width != 0 {
                return Err(invalid(format!("children of trace node {} are misaligned", id)));
            }
            for child in (0..child_items / width).rev() {
                stack.push((children, child * width, Some(index)));
            }
        }
        Ok(())
    }

    fn add_trace_top(&mut self, index: usize) {
        let node = &self.top_down[index];
        if node.allocation_count == 0 {
            return;
        }
        let info = &mut self.function_infos[node.function_info];
        info.trace_tops.push(index);
        info.total_count += node.allocation_count;
        info.total_size += node.allocation_size;
        info.total_live_count += node.live_count;
        info.total_live_size += node.live_size;
    }

    fn bottom_up_tree(&self, info_index: usize) -> &BottomUpTree {
        self.function_infos[info_index]
            .bottom_up
            .get_or_init(|| self.build_bottom_up_tree(info_index))
    }

    /// Inverts every trace top of the function into one caller tree,
    /// merging callers that share a function.
    fn build_bottom_up_tree(&self, info_index: usize) -> BottomUpTree {
        let mut tree = BottomUpTree {
            nodes: vec![BottomUpNode::new(info_index)],
        };
        for &top in &self.function_infos[info_index].trace_tops {
            let trace_top = &self.top_down[top];
            let mut node = top;
            let mut bottom_up = 0;
            loop {
                let entry = &mut tree.nodes[bottom_up];
                entry.allocation_count += trace_top.allocation_count;
                entry.allocation_size += trace_top.allocation_size;
                entry.live_count += trace_top.live_count;
                entry.live_size += trace_top.live_size;
                entry.trace_top_ids.push(trace_top.id);
                let Some(parent) = self.top_down[node].parent else {
                    break;
                };
                node = parent;
                bottom_up = tree.add_caller(bottom_up, self.top_down[parent].function_info);
            }
        }
        tree
    }

    fn serialize_node(
        &self,
        id: u32,
        info_index: usize,
        counts: (u64, u64, u64, u64),
        has_children: bool,
    ) -> SerializedAllocationNode {
        let info = &self.function_infos[info_index];
        let (count, size, live_count, live_size) = counts;
        SerializedAllocationNode {
            id,
            name: info.name.clone(),
            script_name: info.script_name.clone(),
            script_id: info.script_id,
            line: info.line,
            column: info.column,
            count,
            size,
            live_count,
            live_size,
            has_children,
        }
    }

    /// One summary node per function that allocated, largest first.
    /// Function 0 is the synthetic root and is never expandable.
    pub fn serialize_trace_tops(&self) -> Vec<SerializedAllocationNode> {
        let mut state = self.state.borrow_mut();
        if let Some(tops) = &state.trace_tops {
            return tops.clone();
        }
        let mut tops = Vec::new();
        for (index, info) in self.function_infos.iter().enumerate() {
            if info.total_count == 0 {
                continue;
            }
            let id = state.next_node_id;
            state.next_node_id += 1;
            let counts = (
                info.total_count,
                info.total_size,
                info.total_live_count,
                info.total_live_size,
            );
            tops.push(self.serialize_node(id, index, counts, index != 0));
            state.collapsed.insert(id, index);
        }
        tops.sort_by(|a, b| b.size.cmp(&a.size));
        state.trace_tops = Some(tops.clone());
        tops
    }

    fn ensure_bottom_up_node(&self, node_id: u32) -> Result<(usize, usize)> {
        let mut state = self.state.borrow_mut();
        if let Some(&node) = state.id_to_node.get(&node_id) {
            return Ok(node);
        }
        let info = state
            .collapsed
            .remove(&node_id)
            .ok_or(SnapshotError::UnknownAllocationNode(node_id))?;
        state.id_to_node.insert(node_id, (info, 0));
        Ok((info, 0))
    }

    fn serialize_caller(&self, owner: usize, node: usize) -> SerializedAllocationNode {
        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.next_node_id;
            state.next_node_id += 1;
            state.id_to_node.insert(id, (owner, node));
            id
        };
        let caller = &self.bottom_up_tree(owner).nodes[node];
        let counts = (
            caller.allocation_count,
            caller.allocation_size,
            caller.live_count,
            caller.live_size,
        );
        self.serialize_node(id, caller.function_info, counts, !caller.callers.is_empty())
    }

    /// Expands a node returned by [`serialize_trace_tops`](Self::serialize_trace_tops)
    /// or by an earlier expansion.
    pub fn serialize_callers(&self, node_id: u32) -> Result<AllocationNodeCallers> {
        let (owner, mut node) = self.ensure_bottom_up_node(node_id)?;
        let tree = self.bottom_up_tree(owner);
        let mut nodes_with_single_caller = Vec::new();
        while let [caller] = tree.nodes[node].callers[..] {
            node = caller;
            nodes_with_single_caller.push(self.serialize_caller(owner, node));
        }
        let branching_callers = tree.nodes[node]
            .callers
            .iter()
            .map(|&caller| self.serialize_caller(owner, caller))
            .collect();
        Ok(AllocationNodeCallers {
            nodes_with_single_caller,
            branching_callers,
        })
    }

    /// Frames from the allocation site up to the root of the trace tree.
    pub fn serialize_allocation_stack(&self, trace_node_id: u32) -> Result<Vec<AllocationStackFrame>> {
        let mut current = self
            .id_to_top_down
            .get(&trace_node_id)
            .copied()
            .ok_or(SnapshotError::UnknownAllocationNode(trace_node_id))?;
        let mut frames = Vec::new();
        loop {
            let node = &self.top_down[current];
            let info = &self.function_infos[node.function_info];
            frames.push(AllocationStackFrame {
                function_name: info.name.clone(),
                script_name: info.script_name.clone(),
                script_id: info.script_id,
                line: info.line,
                column: info.column,
            });
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(frames)
    }

    /// Trace node ids whose allocations a serialized node accounts for.
    pub fn trace_ids(&self, node_id: u32) -> Result<Vec<u32>> {
        let (owner, node) = self.ensure_bottom_up_node(node_id)?;
        Ok(self.bottom_up_tree(owner).nodes[node].trace_top_ids.clone())
    }

    pub fn function_count(&self) -> usize {
        self.function_infos.len()
    }

    pub fn trace_node_count(&self) -> usize {
        self.top_down.len()
    }

    /// Ids of the children of a trace node, in trace order.
    pub fn trace_children(&self, trace_node_id: u32) -> Option<Vec<u32>> {
        let index = *self.id_to_top_down.get(&trace_node_id)?;
        Some(
            self.top_down[index]
                .children
                .iter()
                .map(|&child| self.top_down[child].id)
                .collect(),
        )
    }
}

fn invalid(message: String) -> SnapshotError {
    SnapshotError::InvalidTrace(message)
}

fn number(item: TraceItem) -> Result<u32> {
    match item {
        TraceItem::Number(value) => Ok(value),
        TraceItem::Array(_) => Err(invalid("expected a number, found an array".to_string())),
    }
}

fn build_function_infos(
    meta: &SnapshotFieldMeta,
    graph: &SnapshotGraph,
    raw: &[u32],
) -> Result<Vec<FunctionInfo>> {
    let layout = FunctionInfoLayout::new(meta)?;
    if raw.len() % layout.field_count != 0 {
        return Err(SnapshotError::Truncated("trace_function_infos"));
    }
    Ok(raw
        .chunks_exact(layout.field_count)
        .map(|record| FunctionInfo {
            name: graph.string(record[layout.name_offset]).to_string(),
            script_name: graph.string(record[layout.script_name_offset]).to_string(),
            script_id: record[layout.script_id_offset],
            line: record[layout.line_offset],
            column: record[layout.column_offset],
            total_count: 0,
            total_size: 0,
            total_live_count: 0,
            total_live_size: 0,
            trace_tops: Vec::new(),
            bottom_up: OnceCell::new(),
        })
        .collect())
}

/// Count and self size of the snapshot's objects per trace node id.
fn live_object_stats(graph: &SnapshotGraph) -> HashMap<u32, LiveStats> {
    let mut live: HashMap<u32, LiveStats> = HashMap::new();
    for node in graph.nodes() {
        let trace_node_id = node.trace_node_id();
        if trace_node_id == 0 {
            continue;
        }
        let stats = live.entry(trace_node_id).or_default();
        stats.count += 1;
        stats.size += u64::from(node.self_size());
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::NodeFilter;
    use crate::snapshot::HeapSnapshot;
    use crate::testing::{SnapshotBuilder, TraceSpec};

    /// (root) -> main -> alloc[2 x 64]
    ///                -> helper -> alloc[1 x 32]
    fn traced() -> SnapshotBuilder {
        let mut b = SnapshotBuilder::new();
        b.function_info("(root)", "", 0, 0, 0);
        b.function_info("main", "app.js", 1, 10, 2);
        b.function_info("alloc", "app.js", 1, 20, 4);
        b.function_info("helper", "lib.js", 2, 5, 0);
        b.trace_tree(
            TraceSpec::new(1, 0, 0, 0).child(
                TraceSpec::new(2, 1, 0, 0)
                    .child(TraceSpec::new(3, 2, 2, 64))
                    .child(TraceSpec::new(4, 3, 0, 0).child(TraceSpec::new(5, 2, 1, 32))),
            ),
        );
        let root = b.node("synthetic", "(root)", 1, 0);
        let foo1 = b.node("object", "Foo", 3, 32);
        let foo2 = b.node("object", "Foo", 5, 16);
        let bar = b.node("object", "Bar", 7, 32);
        b.edge(root, "element", "1", foo1);
        b.edge(root, "element", "2", foo2);
        b.edge(root, "element", "3", bar);
        b.set_trace_node_id(foo1, 3);
        b.set_trace_node_id(foo2, 3);
        b.set_trace_node_id(bar, 5);
        b
    }

    fn profile(snapshot: &HeapSnapshot) -> &AllocationProfile {
        snapshot.allocation_profile().unwrap()
    }

    #[test]
    fn builds_top_down_tree() {
        let snapshot = traced().build();
        let profile = profile(&snapshot);
        assert_eq!(profile.function_count(), 4);
        assert_eq!(profile.trace_node_count(), 5);
        assert_eq!(profile.trace_children(2), Some(vec![3, 4]));
        assert_eq!(profile.trace_children(5), Some(vec![]));
    }

    #[test]
    fn trace_tops_summarise_functions() {
        let snapshot = traced().build();
        let tops = profile(&snapshot).serialize_trace_tops();
        assert_eq!(tops.len(), 1);
        let alloc = &tops[0];
        assert_eq!(alloc.id, 1);
        assert_eq!(alloc.name, "alloc");
        assert_eq!(alloc.count, 3);
        assert_eq!(alloc.size, 96);
        assert_eq!(alloc.live_count, 3);
        assert_eq!(alloc.live_size, 80);
        assert!(alloc.has_children);
        // Cached: same ids on the second call.
        assert_eq!(profile(&snapshot).serialize_trace_tops(), tops);
    }

    #[test]
    fn callers_branch_then_chain() {
        let snapshot = traced().build();
        let profile = profile(&snapshot);
        let tops = profile.serialize_trace_tops();
        let callers = profile.serialize_callers(tops[0].id).unwrap();
        assert!(callers.nodes_with_single_caller.is_empty());
        let names: Vec<&str> = callers.branching_callers.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["main", "helper"]);
        assert_eq!(callers.branching_callers[0].count, 2);
        assert_eq!(callers.branching_callers[1].size, 32);

        let helper = callers.branching_callers[1].id;
        let up = profile.serialize_callers(helper).unwrap();
        let chain: Vec<&str> = up.nodes_with_single_caller.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(chain, vec!["main", "(root)"]);
        assert!(up.branching_callers.is_empty());
        assert!(!up.nodes_with_single_caller[1].has_children);
    }

    #[test]
    fn trace_ids_and_allocation_filter() {
        let snapshot = traced().build();
        let profile = profile(&snapshot);
        let tops = profile.serialize_trace_tops();
        assert_eq!(profile.trace_ids(tops[0].id).unwrap(), vec![3, 5]);
        let callers = profile.serialize_callers(tops[0].id).unwrap();
        let helper = callers.branching_callers[1].id;
        assert_eq!(profile.trace_ids(helper).unwrap(), vec![5]);

        let all = snapshot
            .aggregates(&NodeFilter {
                allocation_node_id: Some(tops[0].id),
                ..NodeFilter::default()
            })
            .unwrap();
        assert_eq!(all.classes["Foo"].count, 2);
        assert_eq!(all.classes["Bar"].count, 1);
        let via_helper = snapshot
            .aggregates(&NodeFilter {
                allocation_node_id: Some(helper),
                ..NodeFilter::default()
            })
            .unwrap();
        assert!(!via_helper.classes.contains_key("Foo"));
        assert_eq!(via_helper.classes["Bar"].count, 1);
    }

    #[test]
    fn allocation_stacks() {
        let snapshot = traced().build();
        let index = snapshot.node_index_for_id(7).unwrap();
        let stack = snapshot.allocation_stack(index).unwrap().unwrap();
        let names: Vec<&str> = stack.iter().map(|f| f.function_name.as_str()).collect();
        assert_eq!(names, vec!["alloc", "helper", "main", "(root)"]);
        assert_eq!(stack[0].line, 20);
        assert_eq!(stack[1].script_name, "lib.js");
    }

    #[test]
    fn unknown_ids_are_errors() {
        let snapshot = traced().build();
        let profile = profile(&snapshot);
        assert!(matches!(
            profile.serialize_callers(99),
            Err(SnapshotError::UnknownAllocationNode(99))
        ));
        assert!(matches!(
            profile.serialize_allocation_stack(42),
            Err(SnapshotError::UnknownAllocationNode(42))
        ));
    }

    #[test]
    fn deep_trace_trees_do_not_recurse() {
        let mut b = SnapshotBuilder::new();
        b.function_info("(root)", "", 0, 0, 0);
        b.function_info("f", "deep.js", 1, 1, 1);
        let depth = 1000;
        let mut spec = TraceSpec::new(depth + 1, 1, 1, 8);
        for id in (1..=depth).rev() {
            spec = TraceSpec::new(id, if id == 1 { 0 } else { 1 }, 0, 0).child(spec);
        }
        b.trace_tree(spec);
        b.node("synthetic", "(root)", 1, 0);
        let snapshot = b.build();
        let profile = profile(&snapshot);
        assert_eq!(profile.trace_node_count(), depth as usize + 1);
        let stack = profile.serialize_allocation_stack(depth + 1).unwrap();
        assert_eq!(stack.len(), depth as usize + 1);
        let tops = profile.serialize_trace_tops();
        let callers = profile.serialize_callers(tops[0].id).unwrap();
        // f calls itself all the way down, then (root).
        assert_eq!(callers.nodes_with_single_caller.len(), depth as usize);
    }
}
