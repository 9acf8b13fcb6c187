use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const NODE_NAMESPACE: Uuid = Uuid::from_u128(0x6c61_7474_6963_655f_6e6f_6465_5f6e_7300);
const EDGE_NAMESPACE: Uuid = Uuid::from_u128(0x6c61_7474_6963_655f_6564_6765_5f6e_7300);

/// A property value from schema-less model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl PropertyValue {
    /// Arrays and objects are kept as their JSON text; `null` has no value.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            other => Some(Self::String(other.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Number(_) => 1,
            Self::String(_) => 2,
        }
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

// ---------------------------------------------------------------------------
// Extraction output (transient)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedNode {
    pub label: String,
    pub node_type: String,
    #[serde(default)]
    pub properties: Properties,
    pub source_chunk_id: Uuid,
}

impl ExtractedNode {
    pub fn new(label: impl Into<String>, node_type: impl Into<String>, source_chunk_id: Uuid) -> Self {
        Self {
            label: label.into(),
            node_type: node_type.into(),
            properties: Properties::new(),
            source_chunk_id,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            label: self.label.clone(),
            node_type: self.node_type.clone(),
        }
    }

    pub fn canonical_key(&self) -> String {
        canonical_key(&self.label, &self.node_type)
    }
}

/// How an edge names one of its endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub label: String,
    pub node_type: String,
}

impl NodeRef {
    pub fn canonical_key(&self) -> String {
        canonical_key(&self.label, &self.node_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedEdge {
    pub source: NodeRef,
    pub target: NodeRef,
    pub relation_type: String,
    #[serde(default)]
    pub properties: Properties,
    pub source_chunk_id: Uuid,
}

impl ExtractedEdge {
    pub fn new(source: NodeRef, target: NodeRef, relation_type: impl Into<String>, source_chunk_id: Uuid) -> Self {
        Self {
            source,
            target,
            relation_type: relation_type.into(),
            properties: Properties::new(),
            source_chunk_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    SchemaViolation,
    DanglingReference,
    Malformed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DroppedRecord {
    pub reason: DropReason,
    pub is_edge: bool,
    pub detail: String,
}

/// Everything the extractor produced for one chunk; the unit of atomic upsert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkExtraction {
    pub chunk_id: Uuid,
    pub nodes: Vec<ExtractedNode>,
    pub edges: Vec<ExtractedEdge>,
    pub dropped: Vec<DroppedRecord>,
}

impl ChunkExtraction {
    pub fn nodes_dropped(&self) -> u64 {
        self.dropped.iter().filter(|d| !d.is_edge).count() as u64
    }

    pub fn edges_dropped(&self) -> u64 {
        self.dropped.iter().filter(|d| d.is_edge).count() as u64
    }
}

// ---------------------------------------------------------------------------
// Persisted graph
// ---------------------------------------------------------------------------

/// A property value together with the chunk that contributed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourcedValue {
    pub value: PropertyValue,
    pub chunk_id: Uuid,
}

/// A value that lost a first-write-wins property merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct MergeConflict {
    pub property: String,
    pub rejected: PropertyValue,
    pub chunk_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphNode {
    pub id: Uuid,
    pub canonical_key: String,
    pub node_type: String,
    pub canonical_label: String,
    /// Chunk that contributed the stored label and type spelling.
    pub origin_chunk_id: Uuid,
    pub properties: BTreeMap<String, SourcedValue>,
    pub provenance: BTreeSet<Uuid>,
    pub conflicts: BTreeSet<MergeConflict>,
}

impl GraphNode {
    pub fn plain_properties(&self) -> Properties {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub relation_type: String,
    pub properties: BTreeMap<String, SourcedValue>,
    pub provenance: BTreeSet<Uuid>,
    pub conflicts: BTreeSet<MergeConflict>,
}

/// Deterministic identity of a node: case-folded type and label, whitespace
/// collapsed.
pub fn canonical_key(label: &str, node_type: &str) -> String {
    format!("{}::{}", fold(node_type), fold(label))
}

fn fold(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn node_id_for_key(key: &str) -> Uuid {
    Uuid::new_v5(&NODE_NAMESPACE, key.as_bytes())
}

pub fn edge_id_for(source_node_id: Uuid, relation_type: &str, target_node_id: Uuid) -> Uuid {
    let name = format!("{source_node_id}|{relation_type}|{target_node_id}");
    Uuid::new_v5(&EDGE_NAMESPACE, name.as_bytes())
}

/// `founded in` / `Founded-In` / `foundedIn` → `FOUNDED_IN`.
pub fn normalize_relation_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_uppercase());
            prev_lower = c.is_lowercase() || c.is_numeric();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
