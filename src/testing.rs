//! Builds small snapshots in wire format for unit tests.

use std::collections::HashMap;
use std::io::Cursor;

use crate::loader::Loader;
use crate::policy::{GenericPolicy, SnapshotPolicy};
use crate::snapshot::HeapSnapshot;

pub const NODE_TYPES: &[&str] = &[
    "hidden",
    "array",
    "string",
    "object",
    "code",
    "closure",
    "regexp",
    "number",
    "native",
    "synthetic",
    "concatenated string",
    "sliced string",
    "symbol",
    "bigint",
];

pub const EDGE_TYPES: &[&str] = &[
    "context", "element", "property", "internal", "hidden", "shortcut", "weak",
];

/// Nested allocation trace node.
pub struct TraceSpec {
    id: u32,
    function_info_index: u32,
    count: u32,
    size: u32,
    children: Vec<TraceSpec>,
}

impl TraceSpec {
    pub fn new(id: u32, function_info_index: u32, count: u32, size: u32) -> Self {
        TraceSpec {
            id,
            function_info_index,
            count,
            size,
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: TraceSpec) -> Self {
        self.children.push(child);
        self
    }

    fn render(&self, out: &mut Vec<String>) {
        out.push(self.id.to_string());
        out.push(self.function_info_index.to_string());
        out.push(self.count.to_string());
        out.push(self.size.to_string());
        let mut children = Vec::new();
        for child in &self.children {
            child.render(&mut children);
        }
        out.push(format!("[{}]", children.join(",")));
    }
}

struct NodeSpec {
    ty: u32,
    name: u32,
    id: u32,
    self_size: u32,
    trace_node_id: u32,
    detachedness: u32,
    edges: Vec<(u32, u32, usize)>,
}

/// Accumulates nodes and edges by ordinal and renders them as a snapshot.
#[derive(Default)]
pub struct SnapshotBuilder {
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
    nodes: Vec<NodeSpec>,
    function_infos: Vec<[u32; 6]>,
    trace_tree: Option<TraceSpec>,
    samples: Option<Vec<(u32, u32)>>,
    locations: Option<Vec<[u32; 4]>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    /// Adds a node and returns its ordinal.
    pub fn node(&mut self, ty: &str, name: &str, id: u32, self_size: u32) -> usize {
        let ty = type_index(NODE_TYPES, ty);
        let name = self.intern(name);
        self.nodes.push(NodeSpec {
            ty,
            name,
            id,
            self_size,
            trace_node_id: 0,
            detachedness: 0,
            edges: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn set_trace_node_id(&mut self, ordinal: usize, trace_node_id: u32) {
        self.nodes[ordinal].trace_node_id = trace_node_id;
    }

    pub fn set_detachedness(&mut self, ordinal: usize, detachedness: u32) {
        self.nodes[ordinal].detachedness = detachedness;
    }

    /// Adds an edge. `element` and `hidden` edges take a numeric name.
    pub fn edge(&mut self, from: usize, ty: &str, name: &str, to: usize) {
        let type_id = type_index(EDGE_TYPES, ty);
        let name = if ty == "element" || ty == "hidden" {
            name.parse().unwrap_or(0)
        } else {
            self.intern(name)
        };
        self.nodes[from].edges.push((type_id, name, to));
    }

    pub fn function_info(&mut self, name: &str, script: &str, script_id: u32, line: u32, column: u32) {
        let function_id = self.function_infos.len() as u32;
        let name = self.intern(name);
        let script = self.intern(script);
        self.function_infos
            .push([function_id, name, script, script_id, line, column]);
    }

    pub fn trace_tree(&mut self, tree: TraceSpec) {
        self.trace_tree = Some(tree);
    }

    pub fn samples(&mut self, samples: &[(u32, u32)]) {
        self.samples = Some(samples.to_vec());
    }

    pub fn location(&mut self, ordinal: usize, script_id: u32, line: u32, column: u32) {
        let index = (ordinal * node_fields().len()) as u32;
        self.locations
            .get_or_insert_with(Vec::new)
            .push([index, script_id, line, column]);
    }

    pub fn to_json(&self) -> String {
        let field_count = node_fields().len();
        let edge_count: usize = self.nodes.iter().map(|n| n.edges.len()).sum();
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for node in &self.nodes {
            nodes.extend([
                node.ty,
                node.name,
                node.id,
                node.self_size,
                node.edges.len() as u32,
                node.trace_node_id,
                node.detachedness,
            ]);
            for &(ty, name, to) in &node.edges {
                edges.extend([ty, name, (to * field_count) as u32]);
            }
        }
        let mut meta = serde_json::json!({
            "node_fields": node_fields(),
            "node_types": [NODE_TYPES, "string", "number", "number", "number", "number", "number"],
            "edge_fields": ["type", "name_or_index", "to_node"],
            "edge_types": [EDGE_TYPES, "string_or_number", "node"],
            "trace_function_info_fields": ["function_id", "name", "script_name", "script_id", "line", "column"],
            "trace_node_fields": ["id", "function_info_index", "count", "size", "children"],
        });
        if self.samples.is_some() {
            meta["sample_fields"] = serde_json::json!(["timestamp_us", "last_assigned_id"]);
        }
        if self.locations.is_some() {
            meta["location_fields"] =
                serde_json::json!(["object_index", "script_id", "line", "column"]);
        }
        let header = serde_json::json!({
            "meta": meta,
            "node_count": self.nodes.len(),
            "edge_count": edge_count,
            "trace_function_count": self.function_infos.len(),
        });

        let mut out = String::new();
        out.push_str("{\"snapshot\":");
        out.push_str(&header.to_string());
        out.push_str(",\n\"nodes\":[");
        out.push_str(&join(&nodes));
        out.push_str("],\n\"edges\":[");
        out.push_str(&join(&edges));
        out.push_str("],\n\"trace_function_infos\":[");
        let infos: Vec<u32> = self.function_infos.iter().flatten().copied().collect();
        out.push_str(&join(&infos));
        out.push_str("],\n\"trace_tree\":");
        match &self.trace_tree {
            Some(tree) => {
                let mut items = Vec::new();
                tree.render(&mut items);
                out.push_str(&format!("[{}]", items.join(",")));
            }
            None => out.push_str("[]"),
        }
        if let Some(samples) = &self.samples {
            let flat: Vec<u32> = samples.iter().flat_map(|&(t, id)| [t, id]).collect();
            out.push_str(",\n\"samples\":[");
            out.push_str(&join(&flat));
            out.push(']');
        }
        if let Some(locations) = &self.locations {
            let flat: Vec<u32> = locations.iter().flatten().copied().collect();
            out.push_str(",\n\"locations\":[");
            out.push_str(&join(&flat));
            out.push(']');
        }
        out.push_str(",\n\"strings\":");
        out.push_str(&serde_json::to_string(&self.strings).unwrap());
        out.push('}');
        out
    }

    pub fn build(&self) -> HeapSnapshot {
        self.build_with(Box::new(GenericPolicy::default()))
    }

    pub fn build_with(&self, policy: Box<dyn SnapshotPolicy>) -> HeapSnapshot {
        let raw = Loader::load(Cursor::new(self.to_json())).unwrap();
        HeapSnapshot::new(raw, policy).unwrap()
    }
}

fn node_fields() -> [&'static str; 7] {
    [
        "type",
        "name",
        "id",
        "self_size",
        "edge_count",
        "trace_node_id",
        "detachedness",
    ]
}

fn type_index(types: &[&str], ty: &str) -> u32 {
    types
        .iter()
        .position(|t| *t == ty)
        .unwrap_or_else(|| panic!("unknown type {ty}")) as u32
}

fn join(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Root, A, B, C where both A and B retain C.
pub fn diamond() -> SnapshotBuilder {
    let mut b = SnapshotBuilder::new();
    let root = b.node("synthetic", "(root)", 1, 0);
    let a = b.node("object", "A", 3, 10);
    let bb = b.node("object", "B", 5, 10);
    let c = b.node("object", "C", 7, 5);
    b.edge(root, "element", "1", a);
    b.edge(root, "element", "2", bb);
    b.edge(a, "property", "c", c);
    b.edge(bb, "property", "c", c);
    b
}
