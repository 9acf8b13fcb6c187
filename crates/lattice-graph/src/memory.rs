use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use lattice_core::document::{Chunk, Document};
use lattice_core::entity::{ChunkExtraction, GraphEdge, GraphNode};
use lattice_core::error::{LatticeError, Result};
use lattice_core::graph::{
    chunk_page_offset, total_chunk_pages, ChunkPage, ChunkPageItem, DocumentGraph, DocumentSummary,
    GraphSchema, GraphStore, ResultRow, SchemaPattern, UpsertResult, CHUNK_PAGE_SIZE,
};

use crate::merge::{apply_extraction, MergeTarget};
use crate::query;

#[derive(Debug, Clone)]
struct RecordedChunk {
    id: Uuid,
    text: String,
    position: usize,
    page_number: Option<u32>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<Uuid, GraphNode>,
    edges: BTreeMap<Uuid, GraphEdge>,
    documents: BTreeMap<Uuid, RecordedDocument>,
}

#[derive(Debug, Clone)]
struct RecordedDocument {
    title: Option<String>,
    source_uri: Option<String>,
    chunks: Vec<RecordedChunk>,
}

/// Nodes and edges written by one chunk, applied to the state only once the
/// whole chunk has merged.
struct Staging<'a> {
    base: &'a GraphState,
    nodes: BTreeMap<Uuid, GraphNode>,
    edges: BTreeMap<Uuid, GraphEdge>,
}

#[async_trait]
impl MergeTarget for Staging<'_> {
    async fn load_node(&mut self, id: Uuid) -> Result<Option<GraphNode>> {
        Ok(self
            .nodes
            .get(&id)
            .or_else(|| self.base.nodes.get(&id))
            .cloned())
    }

    async fn save_node(&mut self, node: &GraphNode, _previous_type: Option<&str>) -> Result<()> {
        self.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn load_edge(&mut self, id: Uuid) -> Result<Option<GraphEdge>> {
        Ok(self
            .edges
            .get(&id)
            .or_else(|| self.base.edges.get(&id))
            .cloned())
    }

    async fn save_edge(&mut self, edge: &GraphEdge) -> Result<()> {
        self.edges.insert(edge.id, edge.clone());
        Ok(())
    }
}

/// In-process graph store. Runs the same merge rules as the Neo4j store and
/// answers a read-only Cypher subset.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
    writer: Mutex<()>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn nodes(&self) -> Vec<GraphNode> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn edges(&self) -> Vec<GraphEdge> {
        self.state.read().await.edges.values().cloned().collect()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert(&self, extraction: &ChunkExtraction) -> Result<UpsertResult> {
        let _writer = self.writer.lock().await;

        let (result, nodes, edges) = {
            let state = self.state.read().await;
            let mut staging = Staging {
                base: &state,
                nodes: BTreeMap::new(),
                edges: BTreeMap::new(),
            };
            let result = apply_extraction(&mut staging, extraction).await?;
            (result, staging.nodes, staging.edges)
        };

        let mut state = self.state.write().await;
        state.nodes.extend(nodes);
        state.edges.extend(edges);

        debug!(
            chunk_id = %extraction.chunk_id,
            nodes = state.nodes.len(),
            edges = state.edges.len(),
            "Committed chunk to memory graph"
        );
        Ok(result)
    }

    async fn query(&self, query_text: &str) -> Result<Vec<ResultRow>> {
        let state = self.state.read().await;
        let rows = query::execute(query_text, &state.nodes, &state.edges)?;
        debug!(query = query_text, rows = rows.len(), "Executed in-memory query");
        Ok(rows)
    }

    async fn schema(&self) -> Result<GraphSchema> {
        let state = self.state.read().await;
        let node_types: BTreeSet<String> = state.nodes.values().map(|n| n.node_type.clone()).collect();
        let relation_types: BTreeSet<String> =
            state.edges.values().map(|e| e.relation_type.clone()).collect();
        let patterns: BTreeSet<SchemaPattern> = state
            .edges
            .values()
            .filter_map(|e| {
                let source = state.nodes.get(&e.source_node_id)?;
                let target = state.nodes.get(&e.target_node_id)?;
                Some(SchemaPattern {
                    source_type: source.node_type.clone(),
                    relation_type: e.relation_type.clone(),
                    target_type: target.node_type.clone(),
                })
            })
            .collect();

        Ok(GraphSchema {
            node_types: node_types.into_iter().collect(),
            relation_types: relation_types.into_iter().collect(),
            patterns: patterns.into_iter().collect(),
        })
    }

    async fn node_count(&self) -> Result<u64> {
        Ok(self.state.read().await.nodes.len() as u64)
    }

    async fn edge_count(&self) -> Result<u64> {
        Ok(self.state.read().await.edges.len() as u64)
    }

    async fn record_chunks(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut recorded: Vec<RecordedChunk> = chunks
            .iter()
            .map(|c| RecordedChunk {
                id: c.id,
                text: c.text.clone(),
                position: c.ordinal + 1,
                page_number: c.page_number,
            })
            .collect();
        recorded.sort_by_key(|c| c.position);

        let recorded = RecordedDocument {
            title: document.title.clone(),
            source_uri: document.source_uri.as_ref().map(|u| u.to_string()),
            chunks: recorded,
        };
        self.state.write().await.documents.insert(document.id, recorded);
        info!(document_id = %document.id, chunks = chunks.len(), "Recorded document chunks");
        Ok(())
    }

    async fn chunk_page(&self, document_id: Uuid, page: usize) -> Result<ChunkPage> {
        let offset = chunk_page_offset(page)?;
        let state = self.state.read().await;
        let document = state
            .documents
            .get(&document_id)
            .ok_or_else(|| LatticeError::NotFound(format!("Document {document_id} not found")))?;

        let items = document
            .chunks
            .iter()
            .skip(offset)
            .take(CHUNK_PAGE_SIZE)
            .map(|c| ChunkPageItem {
                text: c.text.clone(),
                position: c.position,
                page_number: c.page_number,
            })
            .collect();

        Ok(ChunkPage {
            items,
            total_pages: total_chunk_pages(document.chunks.len()),
        })
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .map(|(id, d)| DocumentSummary {
                id: *id,
                title: d.title.clone(),
                source_uri: d.source_uri.clone(),
                total_chunks: d.chunks.len(),
            })
            .collect())
    }

    async fn document_graph(&self, document_ids: &[Uuid]) -> Result<DocumentGraph> {
        let state = self.state.read().await;
        let recorded: Vec<&RecordedDocument> = document_ids
            .iter()
            .filter_map(|id| state.documents.get(id))
            .collect();
        if recorded.is_empty() {
            return Err(LatticeError::NotFound(format!(
                "No recorded chunks for documents {document_ids:?}"
            )));
        }

        let chunk_ids: BTreeSet<Uuid> = recorded
            .iter()
            .flat_map(|d| d.chunks.iter().map(|c| c.id))
            .collect();
        let graph = DocumentGraph::collect(&chunk_ids, state.nodes.values(), state.edges.values());
        debug!(
            documents = recorded.len(),
            nodes = graph.nodes.len(),
            relationships = graph.relationships.len(),
            "Collected document graph"
        );
        Ok(graph)
    }
}
