//! Paginated, sortable views over nodes and edges.
//!
//! A provider captures the items of one query (a node's edges, its
//! retainers, the members of a class, ...) and hands them out in pages.
//! Sorting is deferred: [`ItemProvider::sort_and_rewind`] only records the
//! comparator, and the next page request sorts the whole list once.

use std::cmp::Ordering;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::aggregates::NodeFilter;
use crate::graph::{Edge, Node};
use crate::policy::flags;
use crate::snapshot::{HeapSnapshot, Result, SnapshotError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNode {
    pub id: u32,
    pub name: String,
    pub distance: i32,
    pub node_index: usize,
    pub retained_size: f64,
    pub self_size: u32,
    #[serde(rename = "type")]
    pub node_type: String,
    pub can_be_queried: bool,
    #[serde(rename = "detachedDOMTreeNode")]
    pub detached_dom_tree_node: bool,
}

impl SerializedNode {
    pub fn new(snapshot: &HeapSnapshot, node: Node<'_>) -> Self {
        let ordinal = node.ordinal();
        SerializedNode {
            id: node.id(),
            name: node.name().to_string(),
            distance: snapshot.distance(ordinal),
            node_index: node.index(),
            retained_size: snapshot.retained_size(ordinal),
            self_size: node.self_size(),
            node_type: node.type_name().to_string(),
            can_be_queried: node.flags() & flags::CAN_BE_QUERIED != 0,
            detached_dom_tree_node: node.flags() & flags::DETACHED_DOM_TREE_NODE != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedEdge {
    pub name: String,
    /// Target for outgoing edges, source for retainers.
    pub node: SerializedNode,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub edge_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SerializedItem {
    Node(SerializedNode),
    Edge(SerializedEdge),
}

/// One page of a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRange {
    pub start_position: usize,
    pub end_position: usize,
    pub total_length: usize,
    pub items: Vec<SerializedItem>,
}

/// Primary and secondary sort keys, e.g. `{"fieldName1": "!edgeName",
/// "ascending1": true, "fieldName2": "retainedSize", "ascending2": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparatorConfig {
    pub field_name1: String,
    pub ascending1: bool,
    pub field_name2: String,
    pub ascending2: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortField {
    EdgeName,
    EdgeDistance,
    Name,
    Id,
    SelfSize,
    RetainedSize,
    Distance,
}

impl SortField {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "!edgeName" => SortField::EdgeName,
            "!edgeDistance" => SortField::EdgeDistance,
            "name" => SortField::Name,
            "id" => SortField::Id,
            "selfSize" => SortField::SelfSize,
            "retainedSize" => SortField::RetainedSize,
            "distance" => SortField::Distance,
            other => return Err(SnapshotError::UnknownSortField(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Comparator {
    first: (SortField, bool),
    second: (SortField, bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    /// Items are node indexes.
    Nodes,
    /// Items are edge indexes; the shown node is the target.
    Edges,
    /// Items are retainer slots; the shown node is the source.
    Retainers,
}

pub struct ItemProvider {
    snapshot: Rc<HeapSnapshot>,
    kind: ItemKind,
    iteration_order: Vec<u32>,
    comparator: Option<Comparator>,
    sorted: bool,
}

impl ItemProvider {
    fn new(snapshot: Rc<HeapSnapshot>, kind: ItemKind, iteration_order: Vec<u32>) -> Self {
        ItemProvider {
            snapshot,
            kind,
            iteration_order,
            comparator: None,
            sorted: true,
        }
    }

    /// Outgoing edges of a node that pass the containment filter.
    pub fn edges(snapshot: Rc<HeapSnapshot>, node_index: usize) -> Result<Self> {
        let order = {
            let node = snapshot.checked_node(node_index)?;
            let policy = snapshot.policy();
            node.edges()
                .filter(|&edge| policy.containment_edge_filter(edge))
                .map(|edge| edge.index() as u32)
                .collect()
        };
        Ok(Self::new(snapshot, ItemKind::Edges, order))
    }

    /// Retainers of a node, excluding the root and weak references.
    pub fn retaining_edges(snapshot: Rc<HeapSnapshot>, node_index: usize) -> Result<Self> {
        let order = {
            let node = snapshot.checked_node(node_index)?;
            let graph = snapshot.graph();
            let policy = snapshot.policy();
            graph
                .retainer_slots(node.ordinal())
                .filter(|&slot| {
                    let retainer = graph.retainer(slot);
                    policy.containment_edge_filter(retainer.edge)
                        && !retainer.node.is_root()
                        && !retainer.edge.is_weak()
                })
                .map(|slot| slot as u32)
                .collect()
        };
        Ok(Self::new(snapshot, ItemKind::Retainers, order))
    }

    /// Members of one class under a filter.
    pub fn class_nodes(snapshot: Rc<HeapSnapshot>, class_name: &str, filter: &NodeFilter) -> Result<Self> {
        let order = snapshot
            .aggregates(filter)?
            .classes
            .get(class_name)
            .map(|a| a.idxs.clone())
            .unwrap_or_default();
        Ok(Self::new(snapshot, ItemKind::Nodes, order))
    }

    /// Objects of a class added since the base snapshot. The diff against
    /// that base must have been calculated first.
    pub fn added_nodes(snapshot: Rc<HeapSnapshot>, base_snapshot_id: &str, class_name: &str) -> Self {
        let order = snapshot
            .cached_diff(base_snapshot_id)
            .and_then(|diff| diff.get(class_name).map(|d| d.added_indexes.clone()))
            .unwrap_or_default();
        Self::new(snapshot, ItemKind::Nodes, order)
    }

    /// Objects deleted since this snapshot, by their indexes in it.
    pub fn deleted_nodes(snapshot: Rc<HeapSnapshot>, node_indexes: Vec<u32>) -> Result<Self> {
        for &index in &node_indexes {
            snapshot.checked_node(index as usize)?;
        }
        Ok(Self::new(snapshot, ItemKind::Nodes, node_indexes))
    }

    /// Children of a node in the dominator tree.
    pub fn dominated_nodes(snapshot: Rc<HeapSnapshot>, node_index: usize) -> Result<Self> {
        let order = {
            let node = snapshot.checked_node(node_index)?;
            snapshot.dominated_nodes(node.ordinal()).to_vec()
        };
        Ok(Self::new(snapshot, ItemKind::Nodes, order))
    }

    pub fn is_empty(&self) -> bool {
        self.iteration_order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.iteration_order.len()
    }

    /// Sets the order for subsequent pages and restarts from the top.
    pub fn sort_and_rewind(&mut self, config: &ComparatorConfig) -> Result<()> {
        self.comparator = Some(Comparator {
            first: (SortField::parse(&config.field_name1)?, config.ascending1),
            second: (SortField::parse(&config.field_name2)?, config.ascending2),
        });
        self.sorted = false;
        Ok(())
    }

    fn ensure_sorted(&mut self) {
        if self.sorted {
            return;
        }
        if let Some(comparator) = self.comparator {
            let mut order = std::mem::take(&mut self.iteration_order);
            order.sort_by(|&a, &b| self.compare(&comparator, a, b));
            self.iteration_order = order;
        }
        self.sorted = true;
    }

    /// Items `begin..end`; `end` is clamped to the length.
    pub fn serialize_items_range(&mut self, begin: usize, end: usize) -> Result<ItemsRange> {
        if begin > end {
            return Err(SnapshotError::InvalidRange { begin, end });
        }
        self.ensure_sorted();
        let total_length = self.iteration_order.len();
        let end = end.min(total_length);
        let begin = begin.min(end);
        let items = self.iteration_order[begin..end]
            .iter()
            .map(|&item| self.serialize_item(item))
            .collect();
        Ok(ItemsRange {
            start_position: begin,
            end_position: end,
            total_length,
            items,
        })
    }

    /// Position of the node with `id` in the current order.
    pub fn node_position(&mut self, id: u32) -> Option<usize> {
        self.ensure_sorted();
        self.iteration_order
            .iter()
            .position(|&item| self.item_node(item).id() == id)
    }

    fn serialize_item(&self, item: u32) -> SerializedItem {
        let snapshot = self.snapshot.as_ref();
        let node = SerializedNode::new(snapshot, self.item_node(item));
        match self.item_edge(item) {
            Some(edge) => SerializedItem::Edge(SerializedEdge {
                name: edge.name().into_owned(),
                node,
                edge_type: edge.type_name().to_string(),
                edge_index: edge.index(),
            }),
            None => SerializedItem::Node(node),
        }
    }

    fn item_edge(&self, item: u32) -> Option<Edge<'_>> {
        let graph = self.snapshot.graph();
        match self.kind {
            ItemKind::Nodes => None,
            ItemKind::Edges => Some(graph.edge(item as usize)),
            ItemKind::Retainers => Some(graph.retainer(item as usize).edge),
        }
    }

    fn item_node(&self, item: u32) -> Node<'_> {
        let graph = self.snapshot.graph();
        match self.kind {
            ItemKind::Nodes => graph.node(item as usize),
            ItemKind::Edges => graph.edge(item as usize).target(),
            ItemKind::Retainers => graph.retainer(item as usize).node,
        }
    }

    fn compare(&self, comparator: &Comparator, a: u32, b: u32) -> Ordering {
        self.compare_field(comparator.first, a, b)
            .then_with(|| self.compare_field(comparator.second, a, b))
            .then(a.cmp(&b))
    }

    fn compare_field(&self, (field, ascending): (SortField, bool), a: u32, b: u32) -> Ordering {
        if field == SortField::EdgeName {
            return match (self.item_edge(a), self.item_edge(b)) {
                (Some(edge_a), Some(edge_b)) => compare_edge_names(edge_a, edge_b, ascending),
                _ => Ordering::Equal,
            };
        }
        let node_a = self.item_node(a);
        let node_b = self.item_node(b);
        let snapshot = self.snapshot.as_ref();
        let ordering = match field {
            SortField::Name => node_a.name().cmp(node_b.name()),
            SortField::Id => node_a.id().cmp(&node_b.id()),
            SortField::SelfSize => node_a.self_size().cmp(&node_b.self_size()),
            SortField::RetainedSize => snapshot
                .retained_size(node_a.ordinal())
                .total_cmp(&snapshot.retained_size(node_b.ordinal())),
            SortField::Distance | SortField::EdgeDistance => snapshot
                .distance(node_a.ordinal())
                .cmp(&snapshot.distance(node_b.ordinal())),
            SortField::EdgeName => Ordering::Equal,
        };
        if ascending { ordering } else { ordering.reverse() }
    }
}

/// `__proto__` always sorts last; named edges come before indexed ones.
fn compare_edge_names(a: Edge<'_>, b: Edge<'_>, ascending: bool) -> Ordering {
    let proto = |edge: Edge<'_>| edge.has_string_name() && edge.name() == "__proto__";
    if proto(b) {
        return Ordering::Less;
    }
    if proto(a) {
        return Ordering::Greater;
    }
    let ordering = match (a.has_string_name(), b.has_string_name()) {
        (true, true) => a.name().cmp(&b.name()),
        (false, false) => a.name_or_index().cmp(&b.name_or_index()),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
    };
    if ascending { ordering } else { ordering.reverse() }
}
