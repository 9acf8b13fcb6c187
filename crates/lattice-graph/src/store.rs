use std::collections::BTreeSet;
use std::future::Future;

use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Txn};
use tokio::sync::Mutex;
use uuid::Uuid;

use lattice_core::config::AppConfig;
use lattice_core::document::{Chunk, Document};
use lattice_core::entity::{ChunkExtraction, GraphEdge, GraphNode};
use lattice_core::error::{LatticeError, Result};
use lattice_core::cypher;
use lattice_core::graph::{
    chunk_page_offset, total_chunk_pages, ChunkPage, ChunkPageItem, DocumentGraph, DocumentSummary,
    GraphSchema, GraphStore, ResultRow, SchemaPattern, UpsertResult, CHUNK_PAGE_SIZE,
};

use crate::merge::{apply_extraction, MergeTarget};

/// Timeout for all Neo4j operations (seconds).
const NEO4J_TIMEOUT_SECS: u64 = 5;

/// Cap on the pattern listing returned by `schema()`.
const SCHEMA_PATTERN_LIMIT: i64 = 200;

pub struct Neo4jGraphStore {
    graph: Option<Graph>,
    writer: Mutex<()>,
}

impl Neo4jGraphStore {
    pub async fn new(config: &AppConfig) -> Self {
        let graph = match Graph::new(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password).await {
            Ok(graph) => {
                tracing::info!(uri = %config.neo4j_uri, "Connected to Neo4j");
                Some(graph)
            }
            Err(e) => {
                tracing::warn!(uri = %config.neo4j_uri, error = %e, "Failed to connect to Neo4j, running in degraded mode");
                None
            }
        };
        Self {
            graph,
            writer: Mutex::new(()),
        }
    }

    fn graph(&self) -> Result<&Graph> {
        self.graph.as_ref().ok_or_else(|| LatticeError::Graph("Neo4j not connected".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.graph.is_some()
    }

    async fn count(&self, cypher: &str) -> Result<u64> {
        let mut stream = timed(self.graph()?.execute(query(cypher)))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to count: {}", e)))?;

        match stream.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get("cnt")
                    .map_err(|e| LatticeError::Graph(format!("Failed to get count: {}", e)))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(LatticeError::Graph(format!("Error counting: {}", e))),
        }
    }

    async fn strings(&self, cypher: &str, column: &str) -> Result<Vec<String>> {
        self.strings_with(query(cypher), column).await
    }

    async fn strings_with(&self, q: Query, column: &str) -> Result<Vec<String>> {
        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to read rows: {}", e)))?;

        let mut out = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::Graph(format!("Error reading rows: {}", e)))?
        {
            if let Ok(value) = row.get::<String>(column) {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// JSON `record` column of every row, decoded.
    async fn records<T: serde::de::DeserializeOwned>(&self, q: Query, what: &str) -> Result<Vec<T>> {
        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to read {}: {}", what, e)))?;

        let mut out = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::Graph(format!("Error reading {}: {}", what, e)))?
        {
            let json: String = row
                .get("record")
                .map_err(|e| LatticeError::Graph(format!("Missing {} record: {}", what, e)))?;
            out.push(
                serde_json::from_str(&json)
                    .map_err(|e| LatticeError::Graph(format!("Corrupt {} record: {}", what, e)))?,
            );
        }
        Ok(out)
    }
}

/// Wrap any async operation with a timeout, converting timeout to LatticeError::Graph.
async fn timed<T, F: Future<Output = T>>(op: F) -> std::result::Result<T, LatticeError> {
    tokio::time::timeout(std::time::Duration::from_secs(NEO4J_TIMEOUT_SECS), op)
        .await
        .map_err(|_| {
            tracing::warn!("Neo4j operation timed out after {}s", NEO4J_TIMEOUT_SECS);
            LatticeError::Graph(format!("Neo4j operation timed out after {}s", NEO4J_TIMEOUT_SECS))
        })
}

/// Backtick-quoted label or relationship type. Labels come from model output,
/// so embedded backticks are stripped rather than escaped.
fn quoted(name: &str) -> String {
    format!("`{}`", name.replace('`', ""))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| LatticeError::Graph(format!("Failed to serialize: {}", e)))
}

fn plain_properties_json(properties: &std::collections::BTreeMap<String, lattice_core::entity::SourcedValue>) -> Result<String> {
    let map: serde_json::Map<String, serde_json::Value> = properties
        .iter()
        .map(|(k, v)| (k.clone(), v.value.to_json()))
        .collect();
    to_json(&map)
}

/// Read and write access to the graph inside one open transaction.
struct TxnTarget<'a> {
    txn: &'a mut Txn,
    chunk_id: Uuid,
}

impl TxnTarget<'_> {
    async fn record(&mut self, q: Query) -> Result<Option<String>> {
        let mut stream = timed(self.txn.execute(q))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to read record: {}", e)))?;
        let row = timed(stream.next(self.txn.handle()))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to read record: {}", e)))?;
        Ok(row.and_then(|r| r.get::<String>("record").ok()))
    }

    async fn run(&mut self, q: Query, what: &str) -> Result<()> {
        timed(self.txn.run(q))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to store {}: {}", what, e)))
    }
}

#[async_trait]
impl MergeTarget for TxnTarget<'_> {
    async fn load_node(&mut self, id: Uuid) -> Result<Option<GraphNode>> {
        let q = query("MATCH (n:__Entity__ {id: $id}) RETURN n.record AS record").param("id", id.to_string());
        match self.record(q).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                LatticeError::Graph(format!("Corrupt node record {}: {}", id, e))
            })?)),
            None => Ok(None),
        }
    }

    async fn save_node(&mut self, node: &GraphNode, previous_type: Option<&str>) -> Result<()> {
        let relabel = match previous_type {
            Some(old) if old != node.node_type => format!("REMOVE n:{} ", quoted(old)),
            _ => String::new(),
        };
        let cypher = format!(
            "MERGE (n:__Entity__ {{id: $id}}) \
             SET n.name = $name, n.entity_type = $entity_type, n.canonical_key = $canonical_key, \
               n.properties = $properties, n.provenance = $provenance, n.record = $record \
             {relabel}SET n:{label} \
             WITH n \
             OPTIONAL MATCH (c:Chunk {{id: $chunk_id}}) \
             FOREACH (_ IN CASE WHEN c IS NULL THEN [] ELSE [1] END | MERGE (n)-[:MENTIONED_IN]->(c))",
            label = quoted(&node.node_type),
        );
        let q = query(&cypher)
            .param("id", node.id.to_string())
            .param("name", node.canonical_label.clone())
            .param("entity_type", node.node_type.clone())
            .param("canonical_key", node.canonical_key.clone())
            .param("properties", plain_properties_json(&node.properties)?)
            .param("provenance", to_json(&node.provenance)?)
            .param("record", to_json(node)?)
            .param("chunk_id", self.chunk_id.to_string());
        self.run(q, "node").await?;

        tracing::debug!(node_id = %node.id, name = %node.canonical_label, entity_type = %node.node_type, "Stored node");
        Ok(())
    }

    async fn load_edge(&mut self, id: Uuid) -> Result<Option<GraphEdge>> {
        let q = query("MATCH (:__Entity__)-[r {id: $id}]->(:__Entity__) RETURN r.record AS record")
            .param("id", id.to_string());
        match self.record(q).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                LatticeError::Graph(format!("Corrupt relationship record {}: {}", id, e))
            })?)),
            None => Ok(None),
        }
    }

    async fn save_edge(&mut self, edge: &GraphEdge) -> Result<()> {
        let cypher = format!(
            "MATCH (a:__Entity__ {{id: $source_id}}) \
             MATCH (b:__Entity__ {{id: $target_id}}) \
             MERGE (a)-[r:{} {{id: $id}}]->(b) \
             SET r.properties = $properties, r.provenance = $provenance, r.record = $record",
            quoted(&edge.relation_type)
        );
        let q = query(&cypher)
            .param("source_id", edge.source_node_id.to_string())
            .param("target_id", edge.target_node_id.to_string())
            .param("id", edge.id.to_string())
            .param("properties", plain_properties_json(&edge.properties)?)
            .param("provenance", to_json(&edge.provenance)?)
            .param("record", to_json(edge)?);
        self.run(q, "relationship").await?;

        tracing::debug!(
            rel_id = %edge.id,
            source = %edge.source_node_id,
            target = %edge.target_node_id,
            rel_type = %edge.relation_type,
            "Stored relationship"
        );
        Ok(())
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn upsert(&self, extraction: &ChunkExtraction) -> Result<UpsertResult> {
        let _writer = self.writer.lock().await;
        let mut txn = timed(self.graph()?.start_txn())
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to start transaction: {}", e)))?;

        let applied = {
            let mut target = TxnTarget {
                txn: &mut txn,
                chunk_id: extraction.chunk_id,
            };
            apply_extraction(&mut target, extraction).await
        };

        match applied {
            Ok(result) => {
                timed(txn.commit())
                    .await?
                    .map_err(|e| LatticeError::Graph(format!("Failed to commit transaction: {}", e)))?;
                tracing::info!(
                    chunk_id = %extraction.chunk_id,
                    nodes = extraction.nodes.len(),
                    edges = extraction.edges.len(),
                    "Stored chunk extraction"
                );
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "Failed to roll back transaction");
                }
                Err(e)
            }
        }
    }

    async fn query(&self, query_text: &str) -> Result<Vec<ResultRow>> {
        cypher::ensure_read_only(query_text).map_err(|e| LatticeError::QueryExecution(e.to_string()))?;
        let graph = self
            .graph()
            .map_err(|e| LatticeError::QueryExecution(e.to_string()))?;
        let mut stream = timed(graph.execute(query(query_text)))
            .await
            .map_err(|e| LatticeError::QueryExecution(e.to_string()))?
            .map_err(|e| LatticeError::QueryExecution(format!("Failed to execute cypher: {}", e)))?;

        let mut rows = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::QueryExecution(format!("Failed to read result row: {}", e)))?
        {
            let row: ResultRow = row
                .to()
                .map_err(|e| LatticeError::QueryExecution(format!("Failed to convert result row: {}", e)))?;
            rows.push(row);
        }

        tracing::debug!(cypher = %query_text, rows = rows.len(), "Executed Cypher query");
        Ok(rows)
    }

    async fn schema(&self) -> Result<GraphSchema> {
        let node_types = self
            .strings(
                "MATCH (n:__Entity__) RETURN DISTINCT n.entity_type AS t ORDER BY t",
                "t",
            )
            .await?;
        let relation_types = self
            .strings(
                "MATCH (:__Entity__)-[r]->(:__Entity__) RETURN DISTINCT type(r) AS t ORDER BY t",
                "t",
            )
            .await?;

        let cypher = format!(
            "MATCH (a:__Entity__)-[r]->(b:__Entity__) \
             RETURN DISTINCT a.entity_type AS source, type(r) AS rel, b.entity_type AS target \
             LIMIT {SCHEMA_PATTERN_LIMIT}"
        );
        let mut stream = timed(self.graph()?.execute(query(&cypher)))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to read rows: {}", e)))?;

        let mut patterns = BTreeSet::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::Graph(format!("Error reading rows: {}", e)))?
        {
            if let (Ok(source_type), Ok(relation_type), Ok(target_type)) = (
                row.get::<String>("source"),
                row.get::<String>("rel"),
                row.get::<String>("target"),
            ) {
                patterns.insert(SchemaPattern {
                    source_type,
                    relation_type,
                    target_type,
                });
            }
        }

        Ok(GraphSchema {
            node_types,
            relation_types,
            patterns: patterns.into_iter().collect(),
        })
    }

    async fn node_count(&self) -> Result<u64> {
        self.count("MATCH (n:__Entity__) RETURN count(n) AS cnt").await
    }

    async fn edge_count(&self) -> Result<u64> {
        self.count("MATCH (:__Entity__)-[r]->(:__Entity__) RETURN count(r) AS cnt").await
    }

    async fn record_chunks(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut txn = timed(self.graph()?.start_txn())
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to start transaction: {}", e)))?;

        let mut queries = vec![query(
            "MERGE (d:Document {id: $id}) \
             SET d.title = $title, d.source_type = $source_type, d.source_uri = $source_uri, \
               d.total_chunks = $total_chunks",
        )
        .param("id", document.id.to_string())
        .param("title", document.title.clone().unwrap_or_default())
        .param("source_type", to_json(&document.source_type)?.trim_matches('"').to_string())
        .param(
            "source_uri",
            document.source_uri.as_ref().map(|u| u.to_string()).unwrap_or_default(),
        )
        .param("total_chunks", chunks.len() as i64)];

        for chunk in chunks {
            queries.push(
                query(
                    "MATCH (d:Document {id: $document_id}) \
                     MERGE (c:Chunk {id: $id}) \
                     SET c.text = $text, c.position = $position, c.page_number = $page_number, \
                       c.token_count = $token_count, c.start_offset = $start_offset, \
                       c.end_offset = $end_offset, c.document_id = $document_id \
                     MERGE (c)-[:PART_OF]->(d)",
                )
                .param("document_id", document.id.to_string())
                .param("id", chunk.id.to_string())
                .param("text", chunk.text.clone())
                .param("position", (chunk.ordinal + 1) as i64)
                .param("page_number", chunk.page_number.map(i64::from).unwrap_or(0))
                .param("token_count", chunk.token_count as i64)
                .param("start_offset", chunk.start_offset as i64)
                .param("end_offset", chunk.end_offset as i64),
            );
        }
        for pair in chunks.windows(2) {
            queries.push(
                query("MATCH (a:Chunk {id: $prev}), (b:Chunk {id: $next}) MERGE (a)-[:NEXT_CHUNK]->(b)")
                    .param("prev", pair[0].id.to_string())
                    .param("next", pair[1].id.to_string()),
            );
        }

        let mut failure = None;
        for q in queries {
            if let Err(e) = timed(txn.run(q)).await.and_then(|r| {
                r.map_err(|e| LatticeError::Graph(format!("Failed to store chunk: {}", e)))
            }) {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!(error = %rollback, "Failed to roll back transaction");
            }
            return Err(e);
        }

        timed(txn.commit())
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to commit transaction: {}", e)))?;

        tracing::info!(document_id = %document.id, chunks = chunks.len(), "Recorded document chunks");
        Ok(())
    }

    async fn chunk_page(&self, document_id: Uuid, page: usize) -> Result<ChunkPage> {
        let offset = chunk_page_offset(page)?;
        let skip = i64::try_from(offset)
            .map_err(|_| LatticeError::Config(format!("chunk page {page} is out of range")))?;

        let mut stream = timed(
            self.graph()?.execute(
                query("MATCH (d:Document {id: $id}) RETURN d.total_chunks AS total")
                    .param("id", document_id.to_string()),
            ),
        )
        .await?
        .map_err(|e| LatticeError::Graph(format!("Failed to look up document: {}", e)))?;

        let total: i64 = match stream.next().await {
            Ok(Some(row)) => row.get("total").unwrap_or(0),
            Ok(None) => return Err(LatticeError::NotFound(format!("Document {} not found", document_id))),
            Err(e) => return Err(LatticeError::Graph(format!("Error looking up document: {}", e))),
        };

        let q = query(
            "MATCH (c:Chunk)-[:PART_OF]->(:Document {id: $id}) \
             RETURN c.text AS text, c.position AS position, c.page_number AS page_number \
             ORDER BY c.position SKIP $skip LIMIT $limit",
        )
        .param("id", document_id.to_string())
        .param("skip", skip)
        .param("limit", CHUNK_PAGE_SIZE as i64);

        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| LatticeError::Graph(format!("Failed to page chunks: {}", e)))?;

        let mut items = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::Graph(format!("Error paging chunks: {}", e)))?
        {
            let text: String = row.get("text").unwrap_or_default();
            let position: i64 = row.get("position").unwrap_or(0);
            let page_number: i64 = row.get("page_number").unwrap_or(0);
            items.push(ChunkPageItem {
                text,
                position: position.max(0) as usize,
                page_number: u32::try_from(page_number).ok().filter(|p| *p > 0),
            });
        }

        Ok(ChunkPage {
            items,
            total_pages: total_chunk_pages(total.max(0) as usize),
        })
    }

    async fn documents(&self) -> Result<Vec<DocumentSummary>> {
        let mut stream = timed(self.graph()?.execute(query(
            "MATCH (d:Document) \
             RETURN d.id AS id, d.title AS title, d.source_uri AS source_uri, d.total_chunks AS total \
             ORDER BY d.id",
        )))
        .await?
        .map_err(|e| LatticeError::Graph(format!("Failed to list documents: {}", e)))?;

        let mut documents = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|e| LatticeError::Graph(format!("Error listing documents: {}", e)))?
        {
            let id: String = row.get("id").unwrap_or_default();
            let Ok(id) = Uuid::parse_str(&id) else {
                tracing::warn!(id = %id, "Skipping document with malformed id");
                continue;
            };
            let title: String = row.get("title").unwrap_or_default();
            let source_uri: String = row.get("source_uri").unwrap_or_default();
            let total: i64 = row.get("total").unwrap_or(0);
            documents.push(DocumentSummary {
                id,
                title: Some(title).filter(|t| !t.is_empty()),
                source_uri: Some(source_uri).filter(|u| !u.is_empty()),
                total_chunks: total.max(0) as usize,
            });
        }
        Ok(documents)
    }

    async fn document_graph(&self, document_ids: &[Uuid]) -> Result<DocumentGraph> {
        let ids: Vec<String> = document_ids.iter().map(Uuid::to_string).collect();
        let chunk_ids = self
            .strings_with(
                query("MATCH (c:Chunk)-[:PART_OF]->(d:Document) WHERE d.id IN $ids RETURN c.id AS id")
                    .param("ids", ids.clone()),
                "id",
            )
            .await?;
        if chunk_ids.is_empty() {
            return Err(LatticeError::NotFound(format!(
                "No recorded chunks for documents {document_ids:?}"
            )));
        }

        let nodes: Vec<GraphNode> = self
            .records(
                query(
                    "MATCH (d:Document)<-[:PART_OF]-(:Chunk)<-[:MENTIONED_IN]-(n:__Entity__) \
                     WHERE d.id IN $ids \
                     RETURN DISTINCT n.record AS record",
                )
                .param("ids", ids),
                "node",
            )
            .await?;
        let node_ids: Vec<String> = nodes.iter().map(|n| n.id.to_string()).collect();
        let edges: Vec<GraphEdge> = self
            .records(
                query(
                    "MATCH (a:__Entity__)-[r]->(b:__Entity__) \
                     WHERE a.id IN $node_ids AND b.id IN $node_ids \
                     RETURN DISTINCT r.record AS record",
                )
                .param("node_ids", node_ids),
                "relationship",
            )
            .await?;

        let chunk_ids: BTreeSet<Uuid> = chunk_ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect();
        let graph = DocumentGraph::collect(&chunk_ids, &nodes, &edges);
        tracing::debug!(
            documents = document_ids.len(),
            nodes = graph.nodes.len(),
            relationships = graph.relationships.len(),
            "Collected document graph"
        );
        Ok(graph)
    }
}
