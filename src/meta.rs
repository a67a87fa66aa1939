//! Snapshot metadata and the record layouts derived from it.
//!
//! The `snapshot` object at the top of a heap snapshot declares the field
//! order of every flat record array (`nodes`, `edges`, trace infos, samples,
//! locations) and the type tags used by the `type` fields. Everything that
//! slices the flat buffers goes through the offsets computed here.

use serde::Deserialize;

use crate::snapshot::SnapshotError;

/// Snapshot metadata (the `snapshot` key of the wire format).
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotHeader {
    /// Field layout metadata.
    pub meta: SnapshotFieldMeta,
    /// Number of nodes.
    #[serde(default)]
    pub node_count: usize,
    /// Number of edges.
    #[serde(default)]
    pub edge_count: usize,
    /// Total trace function count.
    #[serde(default)]
    pub trace_function_count: usize,
    /// Optional snapshot title.
    #[serde(default)]
    pub title: Option<String>,
    /// Optional snapshot uid.
    #[serde(default)]
    pub uid: Option<u64>,
}

/// Describes the field layout of every flat record array.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotFieldMeta {
    /// Node field names.
    pub node_fields: Vec<String>,
    /// Node type names. The first entry lists the `type` tags.
    pub node_types: Vec<serde_json::Value>,
    /// Edge field names.
    pub edge_fields: Vec<String>,
    /// Edge type names. The first entry lists the `type` tags.
    pub edge_types: Vec<serde_json::Value>,
    /// Trace function info field names.
    #[serde(default)]
    pub trace_function_info_fields: Vec<String>,
    /// Trace node field names.
    #[serde(default)]
    pub trace_node_fields: Vec<String>,
    /// Sample field names; absent when the snapshot has no samples.
    #[serde(default)]
    pub sample_fields: Option<Vec<String>>,
    /// Location field names; absent when the snapshot has no locations.
    #[serde(default)]
    pub location_fields: Option<Vec<String>>,
}

impl SnapshotFieldMeta {
    /// Type tags of the node `type` field.
    pub fn node_type_names(&self) -> Vec<String> {
        type_names(&self.node_types)
    }

    /// Type tags of the edge `type` field.
    pub fn edge_type_names(&self) -> Vec<String> {
        type_names(&self.edge_types)
    }
}

fn type_names(types: &[serde_json::Value]) -> Vec<String> {
    types
        .first()
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn position(fields: &[String], name: &'static str) -> Option<usize> {
    fields.iter().position(|f| f == name)
}

fn required(fields: &[String], name: &'static str) -> Result<usize, SnapshotError> {
    position(fields, name).ok_or(SnapshotError::MissingField(name))
}

/// Offsets inside one node record.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub field_count: usize,
    pub type_offset: usize,
    pub name_offset: usize,
    pub id_offset: usize,
    pub self_size_offset: usize,
    pub edge_count_offset: usize,
    pub trace_node_id_offset: Option<usize>,
    pub detachedness_offset: Option<usize>,
    pub type_names: Vec<String>,
}

impl NodeLayout {
    pub fn new(meta: &SnapshotFieldMeta) -> Result<Self, SnapshotError> {
        let fields = &meta.node_fields;
        Ok(NodeLayout {
            field_count: fields.len(),
            type_offset: required(fields, "type")?,
            name_offset: required(fields, "name")?,
            id_offset: required(fields, "id")?,
            self_size_offset: required(fields, "self_size")?,
            edge_count_offset: required(fields, "edge_count")?,
            trace_node_id_offset: position(fields, "trace_node_id"),
            detachedness_offset: position(fields, "detachedness"),
            type_names: meta.node_type_names(),
        })
    }
}

/// Offsets inside one edge record.
#[derive(Debug, Clone)]
pub struct EdgeLayout {
    pub field_count: usize,
    pub type_offset: usize,
    pub name_offset: usize,
    pub to_node_offset: usize,
    pub type_names: Vec<String>,
}

impl EdgeLayout {
    pub fn new(meta: &SnapshotFieldMeta) -> Result<Self, SnapshotError> {
        let fields = &meta.edge_fields;
        Ok(EdgeLayout {
            field_count: fields.len(),
            type_offset: required(fields, "type")?,
            name_offset: required(fields, "name_or_index")?,
            to_node_offset: required(fields, "to_node")?,
            type_names: meta.edge_type_names(),
        })
    }
}

/// Resolved node type tags. A tag missing from the metadata never matches.
#[derive(Debug, Clone, Copy)]
pub struct NodeTypes {
    pub hidden: Option<u32>,
    pub array: Option<u32>,
    pub string: Option<u32>,
    pub object: Option<u32>,
    pub code: Option<u32>,
    pub closure: Option<u32>,
    pub regexp: Option<u32>,
    pub native: Option<u32>,
    pub synthetic: Option<u32>,
    pub cons_string: Option<u32>,
    pub sliced_string: Option<u32>,
}

impl NodeTypes {
    pub fn new(names: &[String]) -> Self {
        let find = |tag: &str| names.iter().position(|n| n == tag).map(|i| i as u32);
        NodeTypes {
            hidden: find("hidden"),
            array: find("array"),
            string: find("string"),
            object: find("object"),
            code: find("code"),
            closure: find("closure"),
            regexp: find("regexp"),
            native: find("native"),
            synthetic: find("synthetic"),
            cons_string: find("concatenated string"),
            sliced_string: find("sliced string"),
        }
    }
}

/// Resolved edge type tags.
#[derive(Debug, Clone, Copy)]
pub struct EdgeTypes {
    pub context: Option<u32>,
    pub element: Option<u32>,
    pub property: Option<u32>,
    pub internal: Option<u32>,
    pub hidden: Option<u32>,
    pub shortcut: Option<u32>,
    pub weak: Option<u32>,
    pub invisible: Option<u32>,
}

impl EdgeTypes {
    pub fn new(names: &[String]) -> Self {
        let find = |tag: &str| names.iter().position(|n| n == tag).map(|i| i as u32);
        EdgeTypes {
            context: find("context"),
            element: find("element"),
            property: find("property"),
            internal: find("internal"),
            hidden: find("hidden"),
            shortcut: find("shortcut"),
            weak: find("weak"),
            invisible: find("invisible"),
        }
    }
}

/// Offsets inside one `trace_function_infos` record.
#[derive(Debug, Clone)]
pub struct FunctionInfoLayout {
    pub field_count: usize,
    pub name_offset: usize,
    pub script_name_offset: usize,
    pub script_id_offset: usize,
    pub line_offset: usize,
    pub column_offset: usize,
}

impl FunctionInfoLayout {
    pub fn new(meta: &SnapshotFieldMeta) -> Result<Self, SnapshotError> {
        let fields = &meta.trace_function_info_fields;
        Ok(FunctionInfoLayout {
            field_count: fields.len(),
            name_offset: required(fields, "name")?,
            script_name_offset: required(fields, "script_name")?,
            script_id_offset: required(fields, "script_id")?,
            line_offset: required(fields, "line")?,
            column_offset: required(fields, "column")?,
        })
    }
}

/// Offsets inside one (nested) `trace_tree` record.
#[derive(Debug, Clone)]
pub struct TraceNodeLayout {
    pub field_count: usize,
    pub id_offset: usize,
    pub function_info_index_offset: usize,
    pub count_offset: usize,
    pub size_offset: usize,
    pub children_offset: usize,
}

impl TraceNodeLayout {
    pub fn new(meta: &SnapshotFieldMeta) -> Result<Self, SnapshotError> {
        let fields = &meta.trace_node_fields;
        Ok(TraceNodeLayout {
            field_count: fields.len(),
            id_offset: required(fields, "id")?,
            function_info_index_offset: required(fields, "function_info_index")?,
            count_offset: required(fields, "count")?,
            size_offset: required(fields, "size")?,
            children_offset: required(fields, "children")?,
        })
    }
}
