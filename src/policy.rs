//! Node classification and edge filtering policies.
//!
//! The graph algorithms are object-model agnostic. Everything that depends
//! on what the nodes *mean* (which root children are user roots, which edges
//! the distance BFS ignores, what class a node belongs to, extra flag bits)
//! comes from a [`SnapshotPolicy`] injected at construction.

use std::borrow::Cow;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Edge, Node, SnapshotGraph};

/// Distance assigned to roots that are not user roots.
pub const BASE_SYSTEM_DISTANCE: i32 = 100_000_000;

/// Per-ordinal flag bits set by [`JsHeapPolicy`].
pub mod flags {
    /// Reachable from a user root without crossing engine-internal edges.
    pub const CAN_BE_QUERIED: u8 = 1;
    /// Native node belonging to a detached DOM tree.
    pub const DETACHED_DOM_TREE_NODE: u8 = 2;
    /// Owned by the page: reachable from a global object or a document.
    pub const PAGE_OBJECT: u8 = 4;
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Classification hooks consulted by every analysis pass.
pub trait SnapshotPolicy {
    fn name(&self) -> &'static str;

    /// Computes the per-ordinal flag array. Runs once, after retainers exist.
    fn classify(&self, graph: &SnapshotGraph) -> Vec<u8> {
        vec![0; graph.node_count()]
    }

    /// Flag bit marking user objects. While computing postorder and
    /// dominators, a user object is never entered from a non-user retainer
    /// other than the root. Zero disables the rule.
    fn user_objects_flag(&self) -> u8 {
        0
    }

    /// Whether a child of the root seeds the first (user) BFS pass.
    fn is_user_root(&self, _node: Node<'_>) -> bool {
        true
    }

    /// Extra edge predicate for the distance BFS. Weak edges are always
    /// skipped before this is consulted.
    fn distance_filter(&self, _node: Node<'_>, _edge: Edge<'_>) -> bool {
        true
    }

    fn system_distance(&self) -> i32 {
        BASE_SYSTEM_DISTANCE
    }

    /// Edges shown when listing a node's children.
    fn containment_edge_filter(&self, edge: Edge<'_>) -> bool {
        !edge.is_invisible()
    }

    /// Nodes taking part in aggregation and search.
    fn node_filter(&self, _node: Node<'_>) -> bool {
        true
    }

    fn class_name<'a>(&self, node: Node<'a>) -> Cow<'a, str> {
        default_class_name(node)
    }
}

/// Class of a node: the constructor name for objects and native nodes,
/// a fixed label for a few well-known types, `(type)` for the rest.
pub fn default_class_name(node: Node<'_>) -> Cow<'_, str> {
    let types = node.graph().node_types();
    let ty = Some(node.type_id());
    if ty == types.hidden {
        Cow::Borrowed("(system)")
    } else if ty == types.object || ty == types.native {
        Cow::Borrowed(node.name())
    } else if ty == types.code {
        Cow::Borrowed("(compiled code)")
    } else if ty == types.closure {
        Cow::Borrowed("Function")
    } else if ty == types.regexp {
        Cow::Borrowed("RegExp")
    } else {
        Cow::Owned(format!("({})", node.type_name()))
    }
}

/// Policy for arbitrary object graphs: no flags, every root child is a
/// user root, only invisible edges are hidden.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericPolicy;

impl SnapshotPolicy for GenericPolicy {
    fn name(&self) -> &'static str {
        "generic"
    }
}

// ============================================================================
// JS heap policy
// ============================================================================

/// Edges leaving nodes of `node_type` named `node_name` and called
/// `edge_name` are ignored by the distance BFS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceExclusion {
    pub node_type: String,
    pub node_name: String,
    pub edge_name: String,
}

/// Tunables of [`JsHeapPolicy`], loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Distance given to roots that are not user roots.
    pub system_distance: i32,
    /// Drop hidden nodes and hidden edges from aggregation, search and
    /// edge listings.
    pub exclude_hidden_nodes: bool,
    pub distance_exclusions: Vec<DistanceExclusion>,
    /// Name of the descriptor array whose value slots (every third entry
    /// from index 2 on, shifted by one) are skipped by the distance BFS.
    /// Empty disables the rule.
    pub descriptor_array_name: String,
    /// Name prefix of native nodes in detached DOM trees.
    pub detached_name_prefix: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            system_distance: BASE_SYSTEM_DISTANCE,
            exclude_hidden_nodes: false,
            distance_exclusions: vec![DistanceExclusion {
                node_type: "hidden".to_string(),
                node_name: "system / NativeContext".to_string(),
                edge_name: "sloppy_function_map".to_string(),
            }],
            descriptor_array_name: "(map descriptors)".to_string(),
            detached_name_prefix: "Detached ".to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

const DOCUMENT_DOM_TREES_ROOT: &str = "(Document DOM trees)";
const DETACHED: u32 = 2;

/// Policy for V8 JavaScript heaps.
#[derive(Debug, Clone, Default)]
pub struct JsHeapPolicy {
    config: PolicyConfig,
}

impl JsHeapPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        JsHeapPolicy { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    fn is_document_dom_trees_root(node: Node<'_>) -> bool {
        node.is_type(node.graph().node_types().synthetic) && node.name() == DOCUMENT_DOM_TREES_ROOT
    }

    fn mark_detached_dom_tree_nodes(&self, graph: &SnapshotGraph, flags: &mut [u8]) {
        let native = graph.node_types().native;
        for node in graph.nodes() {
            let detached = node.detachedness() == DETACHED
                || (node.is_type(native)
                    && !self.config.detached_name_prefix.is_empty()
                    && node.name().starts_with(&self.config.detached_name_prefix));
            if detached {
                flags[node.ordinal()] |= flags::DETACHED_DOM_TREE_NODE;
            }
        }
    }

    fn mark_queryable_nodes(&self, graph: &SnapshotGraph, flags: &mut [u8]) {
        let mut stack: Vec<usize> = graph
            .root()
            .edges()
            .map(|edge| edge.target())
            .filter(|&node| self.is_user_root(node))
            .map(|node| node.ordinal())
            .collect();
        while let Some(ordinal) = stack.pop() {
            if flags[ordinal] & flags::CAN_BE_QUERIED != 0 {
                continue;
            }
            flags[ordinal] |= flags::CAN_BE_QUERIED;
            for edge in graph.node_by_ordinal(ordinal).edges() {
                if edge.is_hidden() || edge.is_invisible() || edge.is_internal() || edge.is_weak() {
                    continue;
                }
                let target = edge.target().ordinal();
                if flags[target] & flags::CAN_BE_QUERIED == 0 {
                    stack.push(target);
                }
            }
        }
    }

    fn mark_page_owned_nodes(&self, graph: &SnapshotGraph, flags: &mut [u8]) {
        let mut stack = Vec::new();
        for edge in graph.root().edges() {
            let target = edge.target();
            let seed = edge.is_shortcut()
                || (edge.is_element() && Self::is_document_dom_trees_root(target));
            if seed && flags[target.ordinal()] & flags::PAGE_OBJECT == 0 {
                flags[target.ordinal()] |= flags::PAGE_OBJECT;
                stack.push(target.ordinal());
            }
        }
        while let Some(ordinal) = stack.pop() {
            for edge in graph.node_by_ordinal(ordinal).edges() {
                if edge.is_weak() {
                    continue;
                }
                let target = edge.target().ordinal();
                if flags[target] & flags::PAGE_OBJECT != 0 {
                    continue;
                }
                flags[target] |= flags::PAGE_OBJECT;
                stack.push(target);
            }
        }
    }
}

impl SnapshotPolicy for JsHeapPolicy {
    fn name(&self) -> &'static str {
        "js"
    }

    fn classify(&self, graph: &SnapshotGraph) -> Vec<u8> {
        let mut flags = vec![0u8; graph.node_count()];
        self.mark_detached_dom_tree_nodes(graph, &mut flags);
        self.mark_queryable_nodes(graph, &mut flags);
        self.mark_page_owned_nodes(graph, &mut flags);
        flags
    }

    fn user_objects_flag(&self) -> u8 {
        flags::PAGE_OBJECT
    }

    fn is_user_root(&self, node: Node<'_>) -> bool {
        !node.is_type(node.graph().node_types().synthetic) || Self::is_document_dom_trees_root(node)
    }

    fn distance_filter(&self, node: Node<'_>, edge: Edge<'_>) -> bool {
        let types = node.graph().node_types();
        if node.is_type(types.array) && node.name() == self.config.descriptor_array_name {
            let Ok(index) = edge.name().parse::<u32>() else {
                return true;
            };
            return index < 2 || index % 3 != 1;
        }
        !self.config.distance_exclusions.iter().any(|rule| {
            node.type_name() == rule.node_type
                && node.name() == rule.node_name
                && edge.name() == rule.edge_name
        })
    }

    fn system_distance(&self) -> i32 {
        self.config.system_distance
    }

    fn containment_edge_filter(&self, edge: Edge<'_>) -> bool {
        if edge.is_invisible() {
            return false;
        }
        !self.config.exclude_hidden_nodes
            || !(edge.is_hidden() || edge.target().is_type(edge.target().graph().node_types().hidden))
    }

    fn node_filter(&self, node: Node<'_>) -> bool {
        !self.config.exclude_hidden_nodes || !node.is_type(node.graph().node_types().hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SnapshotBuilder;

    fn page() -> SnapshotBuilder {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let gc_roots = b.node("synthetic", "(GC roots)", 3, 0);
        let window = b.node("object", "Window", 5, 40);
        let doc_trees = b.node("synthetic", "(Document DOM trees)", 7, 0);
        let div = b.node("native", "HTMLDivElement", 9, 20);
        let detached = b.node("native", "Detached HTMLSpanElement", 11, 16);
        let internal = b.node("hidden", "system / Map", 13, 8);
        let cached = b.node("object", "Cached", 15, 12);
        b.edge(root, "element", "1", gc_roots);
        b.edge(root, "shortcut", "window", window);
        b.edge(root, "element", "2", doc_trees);
        b.edge(doc_trees, "element", "1", div);
        b.edge(gc_roots, "element", "1", detached);
        b.edge(window, "internal", "map", internal);
        b.edge(window, "weak", "cache", cached);
        b
    }

    #[test]
    fn js_policy_flags() {
        let snapshot = page().build_with(Box::new(JsHeapPolicy::default()));
        let graph = snapshot.graph();
        let flag_of = |ordinal: usize| graph.flags(ordinal);

        assert_ne!(flag_of(2) & flags::PAGE_OBJECT, 0, "window");
        assert_ne!(flag_of(3) & flags::PAGE_OBJECT, 0, "document trees root");
        assert_ne!(flag_of(4) & flags::PAGE_OBJECT, 0, "div");
        assert_ne!(flag_of(6) & flags::PAGE_OBJECT, 0, "internal edges retain");
        assert_eq!(flag_of(7) & flags::PAGE_OBJECT, 0, "weak edges do not");
        assert_eq!(flag_of(5) & flags::PAGE_OBJECT, 0);

        assert_ne!(flag_of(5) & flags::DETACHED_DOM_TREE_NODE, 0);
        assert_eq!(flag_of(4) & flags::DETACHED_DOM_TREE_NODE, 0);

        assert_ne!(flag_of(2) & flags::CAN_BE_QUERIED, 0);
        assert_ne!(flag_of(4) & flags::CAN_BE_QUERIED, 0);
        assert_eq!(flag_of(6) & flags::CAN_BE_QUERIED, 0, "behind an internal edge");
        assert_eq!(flag_of(1) & flags::CAN_BE_QUERIED, 0, "synthetic roots are not user roots");
    }

    #[test]
    fn detachedness_field_marks_detached_nodes() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let span = b.node("native", "HTMLSpanElement", 3, 16);
        b.edge(root, "element", "1", span);
        b.set_detachedness(span, 2);
        let snapshot = b.build_with(Box::new(JsHeapPolicy::default()));
        assert_ne!(snapshot.graph().flags(1) & flags::DETACHED_DOM_TREE_NODE, 0);
    }

    #[test]
    fn generic_policy_sets_no_flags() {
        let snapshot = page().build();
        assert!(snapshot.graph().nodes().all(|n| n.flags() == 0));
    }

    #[test]
    fn descriptor_array_value_slots_are_skipped() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let descriptors = b.node("array", "(map descriptors)", 3, 64);
        let key = b.node("string", "key", 5, 16);
        let value = b.node("object", "Value", 7, 16);
        b.edge(root, "element", "1", descriptors);
        b.edge(descriptors, "element", "2", key);
        b.edge(descriptors, "element", "4", value);
        let policy = JsHeapPolicy::default();
        let snapshot = b.build_with(Box::new(policy.clone()));
        let graph = snapshot.graph();
        let array = graph.node_by_ordinal(1);
        let verdicts: Vec<bool> = array
            .edges()
            .map(|edge| policy.distance_filter(array, edge))
            .collect();
        assert_eq!(verdicts, vec![true, false]);
    }

    #[test]
    fn native_context_exclusion() {
        let mut b = SnapshotBuilder::new();
        let root = b.node("synthetic", "(root)", 1, 0);
        let context = b.node("hidden", "system / NativeContext", 3, 64);
        let map = b.node("hidden", "system / Map", 5, 16);
        b.edge(root, "element", "1", context);
        b.edge(context, "internal", "sloppy_function_map", map);
        b.edge(context, "internal", "strict_function_map", map);
        let policy = JsHeapPolicy::default();
        let snapshot = b.build_with(Box::new(policy.clone()));
        let context = snapshot.graph().node_by_ordinal(1);
        let verdicts: Vec<bool> = context
            .edges()
            .map(|edge| policy.distance_filter(context, edge))
            .collect();
        assert_eq!(verdicts, vec![false, true]);
    }

    #[test]
    fn config_from_json_uses_defaults() {
        let config: PolicyConfig =
            serde_json::from_str(r#"{"excludeHiddenNodes": true, "systemDistance": 1000}"#).unwrap();
        assert!(config.exclude_hidden_nodes);
        assert_eq!(config.system_distance, 1000);
        assert_eq!(config.descriptor_array_name, "(map descriptors)");
        assert_eq!(config.distance_exclusions.len(), 1);
    }

    #[test]
    fn class_names() {
        let mut b = SnapshotBuilder::new();
        b.node("synthetic", "(root)", 1, 0);
        b.node("object", "Foo", 3, 8);
        b.node("closure", "bar", 5, 8);
        b.node("hidden", "system / Map", 7, 8);
        b.node("code", "baz", 9, 8);
        b.node("string", "hello", 11, 8);
        let snapshot = b.build();
        let names: Vec<String> = snapshot
            .graph()
            .nodes()
            .map(|n| default_class_name(n).into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["(synthetic)", "Foo", "Function", "(system)", "(compiled code)", "(string)"]
        );
    }
}
