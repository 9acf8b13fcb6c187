use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::ops::AddAssign;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Chunk, Document};
use crate::entity::{ChunkExtraction, GraphEdge, GraphNode};
use crate::error::{LatticeError, Result};

/// Number of chunks per page when paging through a document's chunk text.
pub const CHUNK_PAGE_SIZE: usize = 5;

/// One tabular row returned by a graph query, columns in name order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ResultRow(pub BTreeMap<String, serde_json::Value>);

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: serde_json::Value) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.0.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Counters aggregated over one or more atomic upserts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertResult {
    pub nodes_created: u64,
    pub nodes_merged: u64,
    pub edges_created: u64,
    pub edges_merged: u64,
    pub nodes_dropped: u64,
    pub edges_dropped: u64,
    pub chunks_failed: u64,
}

impl AddAssign for UpsertResult {
    fn add_assign(&mut self, rhs: Self) {
        self.nodes_created += rhs.nodes_created;
        self.nodes_merged += rhs.nodes_merged;
        self.edges_created += rhs.edges_created;
        self.edges_merged += rhs.edges_merged;
        self.nodes_dropped += rhs.nodes_dropped;
        self.edges_dropped += rhs.edges_dropped;
        self.chunks_failed += rhs.chunks_failed;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaPattern {
    pub source_type: String,
    pub relation_type: String,
    pub target_type: String,
}

/// Node and edge vocabulary currently present in the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphSchema {
    pub node_types: Vec<String>,
    pub relation_types: Vec<String>,
    pub patterns: Vec<SchemaPattern>,
}

impl GraphSchema {
    pub fn is_empty(&self) -> bool {
        self.node_types.is_empty() && self.relation_types.is_empty()
    }

    /// Prompt-ready description of the graph layout.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(
            "Entity nodes carry the label __Entity__ plus one label per entity type.\n\
             Node properties: id, name, entity_type, canonical_key, properties (JSON string), \
             provenance (JSON string).\n\
             Relationship properties: id, properties (JSON string), provenance (JSON string).\n",
        );

        if self.node_types.is_empty() {
            out.push_str("\nThe graph is currently empty.\n");
            return out;
        }

        out.push_str("\nNode labels:\n");
        for t in &self.node_types {
            let _ = writeln!(out, "  - {t}");
        }
        out.push_str("\nRelationship types:\n");
        if self.relation_types.is_empty() {
            out.push_str("  (none)\n");
        }
        for r in &self.relation_types {
            let _ = writeln!(out, "  - {r}");
        }
        if !self.patterns.is_empty() {
            out.push_str("\nObserved patterns:\n");
            for p in &self.patterns {
                let _ = writeln!(
                    out,
                    "  (:{})-[:{}]->(:{})",
                    p.source_type, p.relation_type, p.target_type
                );
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkPageItem {
    pub text: String,
    pub position: usize,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkPage {
    pub items: Vec<ChunkPageItem>,
    pub total_pages: usize,
}

/// Number of pages needed to show `total` chunks.
pub fn total_chunk_pages(total: usize) -> usize {
    total.div_ceil(CHUNK_PAGE_SIZE)
}

/// Index of the first chunk on a 1-based page.
pub fn chunk_page_offset(page: usize) -> Result<usize> {
    if page == 0 {
        return Err(LatticeError::Config("chunk pages start at 1".into()));
    }
    (page - 1)
        .checked_mul(CHUNK_PAGE_SIZE)
        .ok_or_else(|| LatticeError::Config(format!("chunk page {page} is out of range")))
}

/// A document whose chunks have been recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub title: Option<String>,
    pub source_uri: Option<String>,
    pub total_chunks: usize,
}

/// Entity node as shown in a document graph. `labels` never contains the
/// shared entity label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewNode {
    pub id: Uuid,
    pub labels: Vec<String>,
    pub name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewRelationship {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
}

/// Nodes and relationships mentioned by a set of documents, each listed once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentGraph {
    pub nodes: Vec<ViewNode>,
    pub relationships: Vec<ViewRelationship>,
}

impl DocumentGraph {
    /// Keep what any of `chunk_ids` mentions. A relationship is kept only
    /// when both of its endpoints are kept too.
    pub fn collect<'a>(
        chunk_ids: &BTreeSet<Uuid>,
        nodes: impl IntoIterator<Item = &'a GraphNode>,
        edges: impl IntoIterator<Item = &'a GraphEdge>,
    ) -> Self {
        let mut kept = BTreeMap::new();
        for node in nodes {
            if node.provenance.is_disjoint(chunk_ids) {
                continue;
            }
            kept.entry(node.id).or_insert_with(|| ViewNode {
                id: node.id,
                labels: vec![node.node_type.clone()],
                name: node.canonical_label.clone(),
                properties: node
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.value.to_json()))
                    .collect(),
            });
        }

        let mut relationships = BTreeMap::new();
        for edge in edges {
            let mentioned = !edge.provenance.is_disjoint(chunk_ids);
            let endpoints_kept = kept.contains_key(&edge.source_node_id) && kept.contains_key(&edge.target_node_id);
            if mentioned && endpoints_kept {
                relationships.entry(edge.id).or_insert_with(|| ViewRelationship {
                    id: edge.id,
                    relation_type: edge.relation_type.clone(),
                    source_node_id: edge.source_node_id,
                    target_node_id: edge.target_node_id,
                });
            }
        }

        Self {
            nodes: kept.into_values().collect(),
            relationships: relationships.into_values().collect(),
        }
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Merge one chunk's extraction as a single atomic unit.
    async fn upsert(&self, extraction: &ChunkExtraction) -> Result<UpsertResult>;

    /// Run a read query and return its rows. Store failures surface as
    /// `LatticeError::QueryExecution`; no retry happens here.
    async fn query(&self, query_text: &str) -> Result<Vec<ResultRow>>;

    async fn schema(&self) -> Result<GraphSchema>;

    async fn node_count(&self) -> Result<u64>;
    async fn edge_count(&self) -> Result<u64>;

    /// Persist chunk provenance for a document.
    async fn record_chunks(&self, document: &Document, chunks: &[Chunk]) -> Result<()>;

    /// One page (1-based) of a document's recorded chunk text.
    async fn chunk_page(&self, document_id: Uuid, page: usize) -> Result<ChunkPage>;

    /// Documents with recorded chunks, ordered by id.
    async fn documents(&self) -> Result<Vec<DocumentSummary>>;

    /// Entities and relationships mentioned by the given documents. Fails
    /// with `NotFound` when none of them has recorded chunks.
    async fn document_graph(&self, document_ids: &[Uuid]) -> Result<DocumentGraph>;
}
