use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::config::{ChunkerConfig, QaConfig};
use crate::document::SourceType;
use crate::extraction::SchemaConfig;
use crate::graph::{ChunkPageItem, DocumentGraph, DocumentSummary, GraphSchema, ResultRow, UpsertResult};
use crate::reasoning::{AnswerOutcome, Query};

// --- Health ---

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub graph_backend: String,
    pub graph_connected: bool,
    pub node_count: u64,
    pub edge_count: u64,
}

// --- Ingest ---

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source_type: SourceType,
    pub title: Option<String>,
    pub source_uri: Option<Url>,
    /// Plain text. Ignored when `pages` is non-empty.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Per-request overrides of the server's pipeline defaults.
    pub chunker: Option<ChunkerConfig>,
    pub schema: Option<SchemaConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub document_id: Uuid,
    pub result: UpsertResult,
}

// --- Ask ---

#[derive(Debug, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub qa: Option<QaConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub outcome: AnswerOutcome,
    pub used_context: Vec<ResultRow>,
    pub intermediate_queries: Vec<Query>,
}

impl From<crate::reasoning::Answer> for AskResponse {
    fn from(a: crate::reasoning::Answer) -> Self {
        Self {
            answer: a.text,
            outcome: a.outcome,
            used_context: a.used_context,
            intermediate_queries: a.intermediate_queries,
        }
    }
}

// --- Graph ---

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphQueryRequest {
    pub cypher: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphQueryResponse {
    pub rows: Vec<ResultRow>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphSchemaResponse {
    pub schema: GraphSchema,
    /// Compact text rendering used in translation prompts.
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphStatsResponse {
    pub node_count: u64,
    pub edge_count: u64,
    pub node_types: usize,
    pub relation_types: usize,
}

// --- Documents ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkPageQuery {
    #[serde(default = "default_page")]
    pub page: usize,
}

fn default_page() -> usize {
    1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkPageResponse {
    pub document_id: Uuid,
    pub page: usize,
    pub total_pages: usize,
    pub chunks: Vec<ChunkPageItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentGraphResponse {
    pub document_id: Uuid,
    #[serde(flatten)]
    pub graph: DocumentGraph,
}

// --- Errors ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub reason_code: String,
}
