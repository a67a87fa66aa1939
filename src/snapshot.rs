//! The analysed snapshot: graph core plus every derived structure.
//!
//! Distances, postorder, dominators, retained sizes and the dominated-node
//! index are computed once in [`HeapSnapshot::new`]. Aggregates, diffs,
//! statistics and the allocation profile are built on first use and cached
//! for the lifetime of the snapshot.

use std::borrow::Cow;
use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregates::{Aggregates, NodeFilter, NodePredicate, build_aggregates};
use crate::allocation::{AllocationProfile, AllocationStackFrame};
use crate::diff::{AggregateForDiff, ClassDiff, calculate_snapshot_diff};
use crate::distances::calculate_distances;
use crate::dominators::{
    DominatedNodes, PostOrder, build_dominator_tree, build_post_order, calculate_retained_sizes,
};
use crate::graph::{Node, ProblemReport, SnapshotGraph};
use crate::loader::{LoadError, LogProgress, Progress, RawSnapshot, TraceTree};
use crate::meta::SnapshotHeader;
use crate::policy::SnapshotPolicy;
use crate::search::{SearchConfig, search};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("required field \"{0}\" missing from snapshot metadata")]
    MissingField(&'static str),

    #[error("node type \"{0}\" missing from snapshot metadata")]
    MissingType(&'static str),

    #[error("\"{0}\" length is not a multiple of its record width")]
    Truncated(&'static str),

    #[error("\"{0}\" is too large to index")]
    TooLarge(&'static str),

    #[error("node edge counts sum to {declared} edges but {actual} are present")]
    EdgeCountMismatch { declared: usize, actual: usize },

    #[error("snapshot has no nodes")]
    EmptySnapshot,

    #[error("distance queue overflow: {enqueued} enqueues for {node_count} nodes")]
    BfsOverflow { enqueued: usize, node_count: usize },

    #[error("snapshot has no allocation profile")]
    NoAllocationProfile,

    #[error("unknown allocation node {0}")]
    UnknownAllocationNode(u32),

    #[error("malformed allocation trace: {0}")]
    InvalidTrace(String),

    #[error("invalid search pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("invalid item range {begin}..{end}")]
    InvalidRange { begin: usize, end: usize },

    #[error("no node with index {0}")]
    UnknownNodeIndex(usize),

    #[error("unknown sort field \"{0}\"")]
    UnknownSortField(String),

    #[error("load error: {0}")]
    Load(#[from] LoadError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Added and removed objects per class name.
pub type SnapshotDiff = BTreeMap<String, ClassDiff>;

/// Byte totals by coarse category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total: f64,
    pub v8heap: f64,
    pub native: f64,
    pub code: f64,
    pub js_arrays: f64,
    pub strings: f64,
    pub system: f64,
}

/// Allocation samples recorded while the snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Samples {
    /// Milliseconds.
    pub timestamps: Vec<f64>,
    pub last_assigned_ids: Vec<u32>,
    /// Self size of live objects allocated in each interval.
    pub size_for_range: Vec<f64>,
}

/// Source position an object was allocated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: u32,
    pub line_number: u32,
    pub column_number: u32,
}

pub struct HeapSnapshot {
    header: SnapshotHeader,
    graph: SnapshotGraph,
    policy: Box<dyn SnapshotPolicy>,
    distances: Vec<i32>,
    post_order: PostOrder,
    reports: Vec<ProblemReport>,
    dominators: Vec<u32>,
    retained_sizes: Vec<f64>,
    dominated: DominatedNodes,
    trace_function_infos: Vec<u32>,
    trace_tree: TraceTree,
    samples: Vec<u32>,
    locations: Vec<u32>,
    aggregates: RefCell<HashMap<String, Rc<Aggregates>>>,
    aggregates_for_diff: OnceCell<Rc<HashMap<String, AggregateForDiff>>>,
    diffs: RefCell<HashMap<String, Rc<SnapshotDiff>>>,
    statistics: OnceCell<Statistics>,
    allocation_profile: OnceCell<Option<AllocationProfile>>,
    id_to_index: OnceCell<HashMap<u32, usize>>,
    location_map: OnceCell<HashMap<usize, Location>>,
}

impl HeapSnapshot {
    pub fn new(raw: RawSnapshot, policy: Box<dyn SnapshotPolicy>) -> Result<Self> {
        Self::with_progress(raw, policy, &LogProgress)
    }

    pub fn with_progress(
        raw: RawSnapshot,
        policy: Box<dyn SnapshotPolicy>,
        progress: &dyn Progress,
    ) -> Result<Self> {
        let RawSnapshot {
            header,
            nodes,
            edges,
            trace_function_infos,
            trace_tree,
            samples,
            locations,
            strings,
        } = raw;

        progress.update_status("Building edge indexes…");
        let mut graph = SnapshotGraph::new(&header, nodes, edges, strings)?;
        progress.update_status("Marking nodes…");
        let flags = policy.classify(&graph);
        graph.set_flags(flags);
        progress.update_status("Calculating distances…");
        let distances = calculate_distances(&graph, policy.as_ref())?;
        progress.update_status("Building postorder index…");
        let post_order = build_post_order(&graph, policy.user_objects_flag());
        progress.update_status("Building dominator tree…");
        let dominators = build_dominator_tree(&graph, &post_order, policy.user_objects_flag());
        progress.update_status("Calculating retained sizes…");
        let retained_sizes = calculate_retained_sizes(&graph, &post_order, &dominators);
        progress.update_status("Building dominated nodes…");
        let dominated = DominatedNodes::new(&graph, &dominators);
        progress.update_status("Finished processing.");
        let reports = graph
            .reports()
            .iter()
            .chain(&post_order.reports)
            .cloned()
            .collect();

        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            total_size = retained_sizes[graph.root_ordinal()],
            policy = policy.name(),
            "snapshot ready"
        );

        Ok(HeapSnapshot {
            header,
            graph,
            policy,
            distances,
            post_order,
            reports,
            dominators,
            retained_sizes,
            dominated,
            trace_function_infos,
            trace_tree,
            samples,
            locations,
            aggregates: RefCell::new(HashMap::new()),
            aggregates_for_diff: OnceCell::new(),
            diffs: RefCell::new(HashMap::new()),
            statistics: OnceCell::new(),
            allocation_profile: OnceCell::new(),
            id_to_index: OnceCell::new(),
            location_map: OnceCell::new(),
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn graph(&self) -> &SnapshotGraph {
        &self.graph
    }

    pub fn policy(&self) -> &dyn SnapshotPolicy {
        self.policy.as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn root(&self) -> Node<'_> {
        self.graph.root()
    }

    pub fn distances(&self) -> &[i32] {
        &self.distances
    }

    pub fn distance(&self, ordinal: usize) -> i32 {
        self.distances[ordinal]
    }

    pub fn post_order(&self) -> &PostOrder {
        &self.post_order
    }

    /// Indexing anomalies followed by reachability diagnostics.
    pub fn problem_reports(&self) -> &[ProblemReport] {
        &self.reports
    }

    /// Immediate dominator ordinal; the root dominates itself.
    pub fn dominator(&self, ordinal: usize) -> usize {
        self.dominators[ordinal] as usize
    }

    pub fn retained_size(&self, ordinal: usize) -> f64 {
        self.retained_sizes[ordinal]
    }

    pub fn total_retained_size(&self) -> f64 {
        self.retained_sizes[self.graph.root_ordinal()]
    }

    /// Node indexes immediately dominated by `ordinal`.
    pub fn dominated_nodes(&self, ordinal: usize) -> &[u32] {
        self.dominated.of(ordinal)
    }

    pub fn class_name<'a>(&self, node: Node<'a>) -> Cow<'a, str> {
        self.policy.class_name(node)
    }

    /// Cursor for a node index supplied from outside.
    pub fn checked_node(&self, node_index: usize) -> Result<Node<'_>> {
        if self.graph.is_node_index(node_index) {
            Ok(self.graph.node(node_index))
        } else {
            Err(SnapshotError::UnknownNodeIndex(node_index))
        }
    }

    // ------------------------------------------------------------------------
    // Aggregates and diffs
    // ------------------------------------------------------------------------

    pub fn node_predicate(&self, filter: &NodeFilter) -> Result<NodePredicate> {
        if let Some(allocation_node_id) = filter.allocation_node_id {
            let trace_ids = self.allocation_profile()?.trace_ids(allocation_node_id)?;
            return Ok(NodePredicate::TraceIds(trace_ids.into_iter().collect()));
        }
        if filter.min_node_id.is_some() || filter.max_node_id.is_some() {
            return Ok(NodePredicate::IdRange {
                min: filter.min_node_id.unwrap_or(0),
                max: filter.max_node_id.unwrap_or(u32::MAX),
            });
        }
        Ok(NodePredicate::All)
    }

    /// Per-class aggregates for the nodes passing `filter`. Member lists
    /// are in node order.
    pub fn aggregates(&self, filter: &NodeFilter) -> Result<Rc<Aggregates>> {
        let key = filter.key();
        if let Some(cached) = self.aggregates.borrow().get(&key) {
            return Ok(Rc::clone(cached));
        }
        let predicate = self.node_predicate(filter)?;
        let aggregates = Rc::new(build_aggregates(self, &predicate));
        debug!(key = %key, classes = aggregates.classes.len(), "aggregates built");
        self.aggregates
            .borrow_mut()
            .insert(key, Rc::clone(&aggregates));
        Ok(aggregates)
    }

    /// Like [`aggregates`](Self::aggregates) with member lists sorted by id.
    pub fn sorted_aggregates(&self, filter: &NodeFilter) -> Result<Rc<Aggregates>> {
        let aggregates = self.aggregates(filter)?;
        if aggregates.sorted_by_id {
            return Ok(aggregates);
        }
        let mut sorted = (*aggregates).clone();
        sorted.sort_by_id(&self.graph);
        let sorted = Rc::new(sorted);
        self.aggregates
            .borrow_mut()
            .insert(filter.key(), Rc::clone(&sorted));
        Ok(sorted)
    }

    /// Id-sorted member lists of every class, as another snapshot needs
    /// them to diff against this one.
    pub fn aggregates_for_diff(&self) -> Result<Rc<HashMap<String, AggregateForDiff>>> {
        if let Some(cached) = self.aggregates_for_diff.get() {
            return Ok(Rc::clone(cached));
        }
        let aggregates = self.sorted_aggregates(&NodeFilter::default())?;
        let for_diff: HashMap<String, AggregateForDiff> = aggregates
            .classes
            .iter()
            .map(|(name, aggregate)| {
                (
                    name.clone(),
                    AggregateForDiff::from_indexes(&self.graph, &aggregate.idxs),
                )
            })
            .collect();
        Ok(Rc::clone(
            self.aggregates_for_diff.get_or_init(|| Rc::new(for_diff)),
        ))
    }

    /// Diff of this snapshot against a base, cached per base snapshot id.
    pub fn calculate_snapshot_diff(
        &self,
        base_snapshot_id: &str,
        base_aggregates: &HashMap<String, AggregateForDiff>,
    ) -> Result<Rc<SnapshotDiff>> {
        if let Some(cached) = self.diffs.borrow().get(base_snapshot_id) {
            return Ok(Rc::clone(cached));
        }
        let aggregates = self.sorted_aggregates(&NodeFilter::default())?;
        let diff = Rc::new(calculate_snapshot_diff(
            &self.graph,
            base_aggregates,
            &aggregates,
        ));
        debug!(base = base_snapshot_id, classes = diff.len(), "snapshot diff built");
        self.diffs
            .borrow_mut()
            .insert(base_snapshot_id.to_string(), Rc::clone(&diff));
        Ok(diff)
    }

    /// Diff previously computed against `base_snapshot_id`.
    pub fn cached_diff(&self, base_snapshot_id: &str) -> Option<Rc<SnapshotDiff>> {
        self.diffs.borrow().get(base_snapshot_id).cloned()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn search(&self, config: &SearchConfig, filter: &NodeFilter) -> Result<Vec<u32>> {
        let predicate = self.node_predicate(filter)?;
        search(self, config, &predicate)
    }

    pub fn node_index_for_id(&self, id: u32) -> Option<usize> {
        self.id_to_index
            .get_or_init(|| self.graph.nodes().map(|n| (n.id(), n.index())).collect())
            .get(&id)
            .copied()
    }

    pub fn node_class_name(&self, id: u32) -> Option<String> {
        let index = self.node_index_for_id(id)?;
        Some(self.class_name(self.graph.node(index)).into_owned())
    }

    pub fn ids_of_objects_with_name(&self, name: &str) -> Vec<u32> {
        self.graph
            .nodes()
            .filter(|n| n.name() == name)
            .map(|n| n.id())
            .collect()
    }

    /// Highest object id present in the snapshot.
    pub fn last_seen_object_id(&self) -> u32 {
        self.graph.nodes().map(|n| n.id()).max().unwrap_or(0)
    }

    pub fn statistics(&self) -> &Statistics {
        self.statistics.get_or_init(|| self.calculate_statistics())
    }

    fn calculate_statistics(&self) -> Statistics {
        let types = self.graph.node_types();
        let system_distance = self.policy.system_distance();
        let mut stats = Statistics::default();
        for node in self.graph.nodes() {
            let size = f64::from(node.self_size());
            if self.distances[node.ordinal()] >= system_distance {
                stats.system += size;
                continue;
            }
            let ty = Some(node.type_id());
            if ty == types.native {
                stats.native += size;
            } else if ty == types.code {
                stats.code += size;
            } else if ty == types.cons_string || ty == types.sliced_string || ty == types.string {
                stats.strings += size;
            } else if node.name() == "Array" {
                stats.js_arrays += array_size(node);
            }
        }
        stats.total = self.total_retained_size();
        stats.v8heap = stats.total - stats.native;
        stats
    }

    pub fn samples(&self) -> Option<Samples> {
        if self.samples.is_empty() {
            return None;
        }
        let fields = self.header.meta.sample_fields.as_deref().unwrap_or(&[]);
        let width = fields.len().max(2);
        let timestamp_offset = fields.iter().position(|f| f == "timestamp_us").unwrap_or(0);
        let id_offset = fields
            .iter()
            .position(|f| f == "last_assigned_id")
            .unwrap_or(1);
        let mut timestamps = Vec::new();
        let mut last_assigned_ids = Vec::new();
        for record in self.samples.chunks_exact(width) {
            timestamps.push(f64::from(record[timestamp_offset]) / 1000.0);
            last_assigned_ids.push(record[id_offset]);
        }
        let mut size_for_range = vec![0.0; timestamps.len()];
        for node in self.graph.nodes() {
            let id = node.id();
            if id % 2 == 0 {
                continue;
            }
            let range = last_assigned_ids.partition_point(|&last| last < id);
            if let Some(size) = size_for_range.get_mut(range) {
                *size += f64::from(node.self_size());
            }
        }
        Some(Samples {
            timestamps,
            last_assigned_ids,
            size_for_range,
        })
    }

    pub fn location(&self, node_index: usize) -> Option<Location> {
        self.location_map
            .get_or_init(|| self.build_location_map())
            .get(&node_index)
            .copied()
    }

    fn build_location_map(&self) -> HashMap<usize, Location> {
        let fields = self.header.meta.location_fields.as_deref().unwrap_or(&[]);
        let offset = |name: &str, default: usize| fields.iter().position(|f| f == name).unwrap_or(default);
        let width = fields.len().max(4);
        let (index, script, line, column) = (
            offset("object_index", 0),
            offset("script_id", 1),
            offset("line", 2),
            offset("column", 3),
        );
        self.locations
            .chunks_exact(width)
            .map(|record| {
                (
                    record[index] as usize,
                    Location {
                        script_id: record[script],
                        line_number: record[line],
                        column_number: record[column],
                    },
                )
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Allocation profile
    // ------------------------------------------------------------------------

    pub fn allocation_tracing_enabled(&self) -> bool {
        !self.trace_function_infos.is_empty()
    }

    pub fn allocation_profile(&self) -> Result<&AllocationProfile> {
        if let Some(profile) = self.allocation_profile.get() {
            return profile.as_ref().ok_or(SnapshotError::NoAllocationProfile);
        }
        let profile = if self.allocation_tracing_enabled() {
            Some(AllocationProfile::new(
                &self.header.meta,
                &self.graph,
                &self.trace_function_infos,
                &self.trace_tree,
            )?)
        } else {
            None
        };
        self.allocation_profile
            .get_or_init(|| profile)
            .as_ref()
            .ok_or(SnapshotError::NoAllocationProfile)
    }

    /// Allocation stack of the node, or `None` when it has no trace.
    pub fn allocation_stack(&self, node_index: usize) -> Result<Option<Vec<AllocationStackFrame>>> {
        let node = self.checked_node(node_index)?;
        let trace_node_id = node.trace_node_id();
        if trace_node_id == 0 {
            return Ok(None);
        }
        Ok(Some(
            self.allocation_profile()?
                .serialize_allocation_stack(trace_node_id)?,
        ))
    }
}

/// Self size of a JS array plus its internal `elements` store when nothing
/// else retains it.
fn array_size(node: Node<'_>) -> f64 {
    let mut size = f64::from(node.self_size());
    let elements = node
        .edges()
        .find(|edge| edge.is_internal() && edge.name() == "elements");
    if let Some(edge) = elements {
        let target = edge.target();
        if target.retainer_count() == 1 {
            size += f64::from(target.self_size());
        }
    }
    size
}
