//! Snapshot graph core: the flat buffers plus cursors over them.
//!
//! Nodes and edges are never materialised. A node is identified by its
//! *index* (offset of its record in the node buffer); all derived per-node
//! arrays are keyed by its *ordinal* (`index / record width`). [`Node`] and
//! [`Edge`] are `Copy` cursors that read fields on demand.

use std::borrow::Cow;
use std::fmt;

use tracing::warn;

use crate::meta::{EdgeLayout, EdgeTypes, NodeLayout, NodeTypes, SnapshotHeader};
use crate::snapshot::SnapshotError;

/// Maximum number of offending entries kept in a diagnostic.
pub const MAX_REPORTED: usize = 100;

/// A bounded diagnostic listing offending nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemReport {
    pub title: String,
    pub entries: Vec<String>,
    /// Number of offending entries, including those beyond the cap.
    pub total: usize,
}

impl ProblemReport {
    pub(crate) fn new(title: String) -> Self {
        ProblemReport {
            title,
            entries: Vec::new(),
            total: 0,
        }
    }

    pub(crate) fn add(&mut self, entry: String) {
        self.total += 1;
        if self.entries.len() < MAX_REPORTED {
            self.entries.push(entry);
        }
    }
}

impl fmt::Display for ProblemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        for entry in &self.entries {
            write!(f, "\n  {}", entry)?;
        }
        if self.total > self.entries.len() {
            write!(f, "\n  ... {} more", self.total - self.entries.len())?;
        }
        Ok(())
    }
}


/// Owns the node/edge buffers, the string table and the retainer index.
pub struct SnapshotGraph {
    nodes: Vec<u32>,
    edges: Vec<u32>,
    strings: Vec<String>,
    node_layout: NodeLayout,
    edge_layout: EdgeLayout,
    node_types: NodeTypes,
    edge_types: EdgeTypes,
    node_count: usize,
    root_index: usize,
    /// Per ordinal, offset of the first outgoing edge; `node_count + 1` long.
    first_edge_indexes: Vec<u32>,
    /// Source node index per retainer slot.
    retaining_nodes: Vec<u32>,
    /// Edge index per retainer slot.
    retaining_edges: Vec<u32>,
    /// Per ordinal, first retainer slot; `node_count + 1` long.
    first_retainer_index: Vec<u32>,
    flags: Vec<u8>,
    /// Structural anomalies found while indexing.
    reports: Vec<ProblemReport>,
}

impl SnapshotGraph {
    pub fn new(
        header: &SnapshotHeader,
        nodes: Vec<u32>,
        edges: Vec<u32>,
        strings: Vec<String>,
    ) -> Result<Self, SnapshotError> {
        let node_layout = NodeLayout::new(&header.meta)?;
        let edge_layout = EdgeLayout::new(&header.meta)?;
        let node_types = NodeTypes::new(&node_layout.type_names);
        let edge_types = EdgeTypes::new(&edge_layout.type_names);

        if nodes.len() % node_layout.field_count != 0 {
            return Err(SnapshotError::Truncated("nodes"));
        }
        if edges.len() % edge_layout.field_count != 0 {
            return Err(SnapshotError::Truncated("edges"));
        }
        if edges.len() > u32::MAX as usize {
            return Err(SnapshotError::TooLarge("edges"));
        }
        let node_count = nodes.len() / node_layout.field_count;
        if node_count == 0 {
            return Err(SnapshotError::EmptySnapshot);
        }

        let mut graph = SnapshotGraph {
            nodes,
            edges,
            strings,
            node_layout,
            edge_layout,
            node_types,
            edge_types,
            node_count,
            root_index: 0,
            first_edge_indexes: Vec::new(),
            retaining_nodes: Vec::new(),
            retaining_edges: Vec::new(),
            first_retainer_index: Vec::new(),
            flags: vec![0; node_count],
            reports: Vec::new(),
        };
        graph.build_edge_indexes()?;
        graph.redirect_invalid_edge_targets();
        graph.build_retainers();
        Ok(graph)
    }

    fn build_edge_indexes(&mut self) -> Result<(), SnapshotError> {
        let fields = self.node_layout.field_count;
        let edge_count_offset = self.node_layout.edge_count_offset;
        let mut first = Vec::with_capacity(self.node_count + 1);
        let mut edge_index: u64 = 0;
        for ordinal in 0..self.node_count {
            first.push(edge_index as u32);
            let count = u64::from(self.nodes[ordinal * fields + edge_count_offset]);
            edge_index += count * self.edge_layout.field_count as u64;
            if edge_index > self.edges.len() as u64 {
                break;
            }
        }
        if edge_index != self.edges.len() as u64 || first.len() != self.node_count {
            return Err(SnapshotError::EdgeCountMismatch {
                declared: (edge_index / self.edge_layout.field_count as u64) as usize,
                actual: self.edges.len() / self.edge_layout.field_count,
            });
        }
        first.push(edge_index as u32);
        self.first_edge_indexes = first;
        Ok(())
    }

    /// Points edges whose target is not a node record at the root and
    /// records them in a capped report.
    fn redirect_invalid_edge_targets(&mut self) {
        let fields = self.node_layout.field_count;
        let edge_fields = self.edge_layout.field_count;
        let to_offset = self.edge_layout.to_node_offset;
        let mut report = ProblemReport::new(String::new());
        let mut invalid = Vec::new();
        for ordinal in 0..self.node_count {
            let begin = self.first_edge_indexes[ordinal] as usize;
            let end = self.first_edge_indexes[ordinal + 1] as usize;
            for edge_index in (begin..end).step_by(edge_fields) {
                let to = self.edges[edge_index + to_offset] as usize;
                if to % fields == 0 && to / fields < self.node_count {
                    continue;
                }
                let node = self.node_by_ordinal(ordinal);
                report.add(format!(
                    "{} @{} edge \"{}\" points to offset {}",
                    node.name(),
                    node.id(),
                    self.edge(edge_index).name(),
                    to
                ));
                invalid.push(edge_index);
            }
        }
        if invalid.is_empty() {
            return;
        }
        for edge_index in invalid {
            self.edges[edge_index + to_offset] = self.root_index as u32;
        }
        report.title = format!(
            "Heap snapshot: {} edges point outside the node buffer and were redirected to the root:",
            report.total
        );
        warn!("{}", report);
        self.reports.push(report);
    }

    /// Counting sort of all edges by target ordinal.
    fn build_retainers(&mut self) {
        let fields = self.node_layout.field_count;
        let edge_fields = self.edge_layout.field_count;
        let to_offset = self.edge_layout.to_node_offset;
        let edge_count = self.edges.len() / edge_fields;

        let mut first_retainer = vec![0u32; self.node_count + 1];
        for edge_index in (0..self.edges.len()).step_by(edge_fields) {
            let to_ordinal = self.edges[edge_index + to_offset] as usize / fields;
            first_retainer[to_ordinal] += 1;
        }
        let mut next_slot = 0u32;
        for slot in first_retainer.iter_mut().take(self.node_count) {
            let count = *slot;
            *slot = next_slot;
            next_slot += count;
        }
        first_retainer[self.node_count] = edge_count as u32;

        let mut cursor: Vec<u32> = first_retainer[..self.node_count].to_vec();
        let mut retaining_nodes = vec![0u32; edge_count];
        let mut retaining_edges = vec![0u32; edge_count];
        for ordinal in 0..self.node_count {
            let begin = self.first_edge_indexes[ordinal] as usize;
            let end = self.first_edge_indexes[ordinal + 1] as usize;
            for edge_index in (begin..end).step_by(edge_fields) {
                let to_ordinal = self.edges[edge_index + to_offset] as usize / fields;
                let slot = cursor[to_ordinal] as usize;
                cursor[to_ordinal] += 1;
                retaining_nodes[slot] = (ordinal * fields) as u32;
                retaining_edges[slot] = edge_index as u32;
            }
        }
        self.first_retainer_index = first_retainer;
        self.retaining_nodes = retaining_nodes;
        self.retaining_edges = retaining_edges;
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len() / self.edge_layout.field_count
    }

    pub fn node_field_count(&self) -> usize {
        self.node_layout.field_count
    }

    pub fn edge_field_count(&self) -> usize {
        self.edge_layout.field_count
    }

    pub fn node_layout(&self) -> &NodeLayout {
        &self.node_layout
    }

    pub fn edge_layout(&self) -> &EdgeLayout {
        &self.edge_layout
    }

    pub fn node_types(&self) -> &NodeTypes {
        &self.node_types
    }

    pub fn edge_types(&self) -> &EdgeTypes {
        &self.edge_types
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn string(&self, index: u32) -> &str {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn root_index(&self) -> usize {
        self.root_index
    }

    pub fn root_ordinal(&self) -> usize {
        self.root_index / self.node_layout.field_count
    }

    pub fn root(&self) -> Node<'_> {
        self.node(self.root_index)
    }

    /// Cursor for the node record at `index`.
    pub fn node(&self, index: usize) -> Node<'_> {
        debug_assert_eq!(index % self.node_layout.field_count, 0);
        Node { graph: self, index }
    }

    pub fn node_by_ordinal(&self, ordinal: usize) -> Node<'_> {
        self.node(self.index_of(ordinal))
    }

    pub fn ordinal_of(&self, index: usize) -> usize {
        index / self.node_layout.field_count
    }

    pub fn index_of(&self, ordinal: usize) -> usize {
        ordinal * self.node_layout.field_count
    }

    /// Whether `index` is a valid node record boundary.
    pub fn is_node_index(&self, index: usize) -> bool {
        index % self.node_layout.field_count == 0 && index < self.nodes.len()
    }

    /// All nodes in buffer order.
    pub fn nodes(&self) -> impl Iterator<Item = Node<'_>> {
        (0..self.node_count).map(move |ordinal| self.node_by_ordinal(ordinal))
    }

    pub fn edge(&self, index: usize) -> Edge<'_> {
        Edge { graph: self, index }
    }

    pub fn first_edge_index(&self, ordinal: usize) -> usize {
        self.first_edge_indexes[ordinal] as usize
    }

    /// Retainer stored at `slot` of the retainer index.
    pub fn retainer(&self, slot: usize) -> Retainer<'_> {
        Retainer {
            node: self.node(self.retaining_nodes[slot] as usize),
            edge: self.edge(self.retaining_edges[slot] as usize),
        }
    }

    pub fn retainer_slots(&self, ordinal: usize) -> std::ops::Range<usize> {
        self.first_retainer_index[ordinal] as usize..self.first_retainer_index[ordinal + 1] as usize
    }

    pub fn flags(&self, ordinal: usize) -> u8 {
        self.flags[ordinal]
    }

    pub fn set_flags(&mut self, flags: Vec<u8>) {
        debug_assert_eq!(flags.len(), self.node_count);
        self.flags = flags;
    }

    /// Edges that keep their target alive. Shortcuts only count when they
    /// leave the root, where they mark user global objects.
    pub fn is_essential_edge(&self, node_index: usize, edge_type: u32) -> bool {
        Some(edge_type) != self.edge_types.weak
            && (Some(edge_type) != self.edge_types.shortcut || node_index == self.root_index)
    }

    /// True when every retainer of the node is a weak or shortcut edge
    /// (vacuously true for nodes without retainers).
    pub fn has_only_weak_retainers(&self, ordinal: usize) -> bool {
        self.retainer_slots(ordinal).all(|slot| {
            let edge = self.edge(self.retaining_edges[slot] as usize);
            edge.is_weak() || edge.is_shortcut()
        })
    }

    /// Anomalies found while indexing the buffers.
    pub fn reports(&self) -> &[ProblemReport] {
        &self.reports
    }
}

/// Cursor over one node record.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    graph: &'a SnapshotGraph,
    index: usize,
}

impl<'a> Node<'a> {
    fn field(&self, offset: usize) -> u32 {
        self.graph.nodes[self.index + offset]
    }

    pub fn graph(&self) -> &'a SnapshotGraph {
        self.graph
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ordinal(&self) -> usize {
        self.graph.ordinal_of(self.index)
    }

    pub fn type_id(&self) -> u32 {
        self.field(self.graph.node_layout.type_offset)
    }

    pub fn type_name(&self) -> &'a str {
        self.graph
            .node_layout
            .type_names
            .get(self.type_id() as usize)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// Whether the node's type is the given (possibly absent) tag.
    pub fn is_type(&self, tag: Option<u32>) -> bool {
        tag == Some(self.type_id())
    }

    pub fn name_index(&self) -> u32 {
        self.field(self.graph.node_layout.name_offset)
    }

    pub fn name(&self) -> &'a str {
        self.graph.string(self.name_index())
    }

    pub fn id(&self) -> u32 {
        self.field(self.graph.node_layout.id_offset)
    }

    pub fn self_size(&self) -> u32 {
        self.field(self.graph.node_layout.self_size_offset)
    }

    pub fn edge_count(&self) -> usize {
        self.field(self.graph.node_layout.edge_count_offset) as usize
    }

    /// Allocation trace node id, 0 when unknown.
    pub fn trace_node_id(&self) -> u32 {
        self.graph
            .node_layout
            .trace_node_id_offset
            .map_or(0, |offset| self.field(offset))
    }

    pub fn detachedness(&self) -> u32 {
        self.graph
            .node_layout
            .detachedness_offset
            .map_or(0, |offset| self.field(offset))
    }

    pub fn flags(&self) -> u8 {
        self.graph.flags(self.ordinal())
    }

    pub fn is_root(&self) -> bool {
        self.index == self.graph.root_index
    }

    pub fn edges(&self) -> Edges<'a> {
        let ordinal = self.ordinal();
        Edges {
            graph: self.graph,
            next: self.graph.first_edge_index(ordinal),
            end: self.graph.first_edge_index(ordinal + 1),
        }
    }

    pub fn retainers(&self) -> Retainers<'a> {
        Retainers {
            graph: self.graph,
            slots: self.graph.retainer_slots(self.ordinal()),
        }
    }

    pub fn retainer_count(&self) -> usize {
        self.graph.retainer_slots(self.ordinal()).len()
    }
}

impl std::fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @{}", self.name(), self.id())
    }
}

/// Cursor over one edge record.
#[derive(Clone, Copy)]
pub struct Edge<'a> {
    graph: &'a SnapshotGraph,
    index: usize,
}

impl<'a> Edge<'a> {
    fn field(&self, offset: usize) -> u32 {
        self.graph.edges[self.index + offset]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn type_id(&self) -> u32 {
        self.field(self.graph.edge_layout.type_offset)
    }

    pub fn type_name(&self) -> &'a str {
        self.graph
            .edge_layout
            .type_names
            .get(self.type_id() as usize)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    fn is_type(&self, tag: Option<u32>) -> bool {
        tag == Some(self.type_id())
    }

    pub fn is_weak(&self) -> bool {
        self.is_type(self.graph.edge_types.weak)
    }

    pub fn is_shortcut(&self) -> bool {
        self.is_type(self.graph.edge_types.shortcut)
    }

    pub fn is_element(&self) -> bool {
        self.is_type(self.graph.edge_types.element)
    }

    pub fn is_hidden(&self) -> bool {
        self.is_type(self.graph.edge_types.hidden)
    }

    pub fn is_internal(&self) -> bool {
        self.is_type(self.graph.edge_types.internal)
    }

    pub fn is_invisible(&self) -> bool {
        self.is_type(self.graph.edge_types.invisible)
    }

    pub fn name_or_index(&self) -> u32 {
        self.field(self.graph.edge_layout.name_offset)
    }

    /// Element and hidden edges carry a numeric index instead of a name.
    pub fn has_string_name(&self) -> bool {
        !self.is_element() && !self.is_hidden()
    }

    pub fn name(&self) -> Cow<'a, str> {
        if self.has_string_name() {
            Cow::Borrowed(self.graph.string(self.name_or_index()))
        } else {
            Cow::Owned(self.name_or_index().to_string())
        }
    }

    pub fn target_index(&self) -> usize {
        self.field(self.graph.edge_layout.to_node_offset) as usize
    }

    pub fn target(&self) -> Node<'a> {
        self.graph.node(self.target_index())
    }
}

/// Outgoing edges of one node.
pub struct Edges<'a> {
    graph: &'a SnapshotGraph,
    next: usize,
    end: usize,
}

impl<'a> Iterator for Edges<'a> {
    type Item = Edge<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let edge = self.graph.edge(self.next);
        self.next += self.graph.edge_layout.field_count;
        Some(edge)
    }
}

/// An incoming edge together with the node it leaves.
#[derive(Clone, Copy)]
pub struct Retainer<'a> {
    pub node: Node<'a>,
    pub edge: Edge<'a>,
}

/// Incoming edges of one node.
pub struct Retainers<'a> {
    graph: &'a SnapshotGraph,
    slots: std::ops::Range<usize>,
}

impl<'a> Iterator for Retainers<'a> {
    type Item = Retainer<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.slots.next().map(|slot| self.graph.retainer(slot))
    }
}
