use std::collections::HashMap;
use std::time::Duration;

use lattice_core::api_types::{
    AskRequest, AskResponse, ChunkPageQuery, ChunkPageResponse, ErrorResponse, GraphStatsResponse,
    HealthResponse, IngestRequest, IngestResponse,
};
use lattice_core::config::{AppConfig, GraphBackend, SplitStrategy};
use lattice_core::document::SourceType;
use lattice_core::graph::{ChunkPageItem, ResultRow, UpsertResult};
use lattice_core::reasoning::{Answer, AnswerOutcome, Query};
use lattice_core::LatticeError;
use uuid::Uuid;

fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AppConfig::from_lookup(|key| vars.get(key).cloned())
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[test]
fn ingest_request_minimal_body() {
    let req: IngestRequest =
        serde_json::from_str(r#"{"source_type": "transcript", "text": "Alice founded Acme."}"#)
            .expect("failed to deserialize IngestRequest");

    assert_eq!(req.source_type, SourceType::Transcript);
    assert_eq!(req.text, "Alice founded Acme.");
    assert!(req.pages.is_empty());
    assert!(req.chunker.is_none());
    assert!(req.schema.is_none());
    assert!(req.title.is_none());
}

#[test]
fn ingest_request_with_overrides() {
    let body = r#"{
        "source_type": "wiki",
        "title": "Acme",
        "source_uri": "https://example.org/acme",
        "pages": ["one", "two"],
        "chunker": {"chunk_size": 50, "chunk_overlap": 5, "strategy": "semantic"},
        "schema": {"allowed_node_types": ["Person"], "allowed_relation_types": ["FOUNDED"]}
    }"#;
    let req: IngestRequest = serde_json::from_str(body).expect("failed to deserialize IngestRequest");

    let chunker = req.chunker.expect("chunker override");
    assert_eq!(chunker.chunk_size, 50);
    assert_eq!(chunker.strategy, SplitStrategy::Semantic);
    assert_eq!(chunker.max_chunks, None);
    let schema = req.schema.expect("schema override");
    assert!(schema.allowed_node_types.contains("Person"));
    assert_eq!(req.pages.len(), 2);
    assert_eq!(req.source_uri.map(|u| u.host_str().map(str::to_owned)), Some(Some("example.org".into())));
}

#[test]
fn ingest_request_rejects_unknown_source_type() {
    let result: Result<IngestRequest, _> = serde_json::from_str(r#"{"source_type": "fax", "text": "x"}"#);
    assert!(result.is_err());
}

#[test]
fn ask_request_partial_qa_overrides_use_defaults() {
    let req: AskRequest =
        serde_json::from_str(r#"{"question": "Who founded Acme?", "qa": {"multi_step": true}}"#)
            .expect("failed to deserialize AskRequest");

    let qa = req.qa.expect("qa override");
    assert!(qa.multi_step);
    assert_eq!(qa.top_k, 10);
    assert!(qa.validate_query);
    assert_eq!(qa.max_steps, 3);
    assert_eq!(qa.max_translation_retries, 3);
}

#[test]
fn chunk_page_query_defaults_to_first_page() {
    let query: ChunkPageQuery = serde_json::from_str("{}").expect("failed to deserialize ChunkPageQuery");
    assert_eq!(query.page, 1);
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[test]
fn ask_response_from_unanswerable_answer() {
    let response: AskResponse = Answer::unanswerable("translation_error").into();
    let json = serde_json::to_value(&response).expect("failed to serialize AskResponse");

    assert_eq!(json["outcome"]["kind"], "unanswerable");
    assert_eq!(json["outcome"]["reason_code"], "translation_error");
    assert!(!json["answer"].as_str().unwrap_or_default().is_empty());
    assert_eq!(json["used_context"], serde_json::json!([]));
}

#[test]
fn ask_response_carries_rows_and_queries() {
    let answer = Answer {
        text: "Alice founded Acme.".into(),
        used_context: vec![ResultRow::new().with("founder", "Alice".into())],
        intermediate_queries: vec![Query {
            natural_language_text: "Who founded Acme?".into(),
            generated_query_text: "MATCH (p:Person)-[:FOUNDED]->(o) RETURN p.name AS founder".into(),
            validated: true,
            attempt: 1,
        }],
        outcome: AnswerOutcome::Grounded,
    };

    let json = serde_json::to_string(&AskResponse::from(answer)).expect("failed to serialize AskResponse");
    let back: AskResponse = serde_json::from_str(&json).expect("failed to deserialize AskResponse");

    assert_eq!(back.answer, "Alice founded Acme.");
    assert_eq!(back.outcome, AnswerOutcome::Grounded);
    assert_eq!(back.used_context[0].get("founder"), Some(&serde_json::Value::from("Alice")));
    assert!(back.intermediate_queries[0].validated);
    assert!(json.contains(r#""founder":"Alice""#));
}

#[test]
fn ingest_response_serializes_counters() {
    let response = IngestResponse {
        document_id: Uuid::nil(),
        result: UpsertResult {
            nodes_created: 3,
            edges_created: 2,
            chunks_failed: 1,
            ..Default::default()
        },
    };
    let json = serde_json::to_value(&response).expect("failed to serialize IngestResponse");
    assert_eq!(json["result"]["nodes_created"], 3);
    assert_eq!(json["result"]["chunks_failed"], 1);
    assert_eq!(json["result"]["nodes_merged"], 0);
}

#[test]
fn health_and_stats_roundtrip() {
    let health = HealthResponse {
        status: "degraded".into(),
        version: "0.1.0".into(),
        graph_backend: "neo4j".into(),
        graph_connected: false,
        node_count: 0,
        edge_count: 0,
    };
    let json = serde_json::to_string(&health).expect("failed to serialize HealthResponse");
    let back: HealthResponse = serde_json::from_str(&json).expect("failed to deserialize HealthResponse");
    assert_eq!(back.status, "degraded");
    assert!(!back.graph_connected);

    let stats = GraphStatsResponse {
        node_count: 3,
        edge_count: 2,
        node_types: 2,
        relation_types: 2,
    };
    let json = serde_json::to_value(&stats).expect("failed to serialize GraphStatsResponse");
    assert_eq!(json["node_types"], 2);
}

#[test]
fn chunk_page_response_roundtrip() {
    let response = ChunkPageResponse {
        document_id: Uuid::new_v4(),
        page: 2,
        total_pages: 3,
        chunks: vec![ChunkPageItem {
            text: "Alice founded Acme.".into(),
            position: 6,
            page_number: None,
        }],
    };
    let json = serde_json::to_string(&response).expect("failed to serialize ChunkPageResponse");
    let back: ChunkPageResponse = serde_json::from_str(&json).expect("failed to deserialize ChunkPageResponse");
    assert_eq!(back.page, 2);
    assert_eq!(back.chunks[0].position, 6);
}

#[test]
fn error_response_uses_stable_reason_codes() {
    let err = LatticeError::Translation {
        attempts: 3,
        reason: "query is invalid".into(),
    };
    let body = ErrorResponse {
        error: err.to_string(),
        reason_code: err.reason_code().into(),
    };
    let json = serde_json::to_value(&body).expect("failed to serialize ErrorResponse");
    assert_eq!(json["reason_code"], "translation_error");
    assert_eq!(LatticeError::Timeout(Duration::from_secs(1)).reason_code(), "timeout");
    assert!(LatticeError::Timeout(Duration::from_secs(1)).is_transient());
    assert!(!LatticeError::Config("x".into()).is_transient());
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[test]
fn app_config_defaults() {
    let config = config_from(&[]);

    assert_eq!(config.graph_backend, GraphBackend::Neo4j);
    assert_eq!(config.neo4j_uri, "bolt://localhost:7687");
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.pipeline.chunker.chunk_size, 200);
    assert_eq!(config.pipeline.chunker.chunk_overlap, 20);
    assert_eq!(config.pipeline.chunker.strategy, SplitStrategy::FixedToken);
    assert_eq!(config.pipeline.qa.top_k, 10);
    assert_eq!(config.pipeline.fan_out, 4);
    assert!(!config.pipeline.persist_chunks);
    assert!(config.pipeline.schema.allowed_node_types.is_empty());
    assert!(config.pipeline.validate().is_ok());
}

#[test]
fn app_config_custom_values() {
    let config = config_from(&[
        ("GRAPH_BACKEND", "memory"),
        ("SERVER_PORT", "9000"),
        ("LATTICE_CHUNK_SIZE", "64"),
        ("LATTICE_CHUNK_OVERLAP", "8"),
        ("LATTICE_SPLIT_STRATEGY", "structural"),
        ("LATTICE_ALLOWED_NODE_TYPES", "Person, Organization,"),
        ("LATTICE_MULTI_STEP", "true"),
        ("LATTICE_MODEL_TIMEOUT_SECS", "30"),
        ("LATTICE_PERSIST_CHUNKS", "true"),
        ("LATTICE_SYNTHESIS_MODEL", "custom-model"),
    ]);

    assert_eq!(config.graph_backend, GraphBackend::Memory);
    assert_eq!(config.server_port, 9000);
    assert_eq!(config.pipeline.chunker.chunk_size, 64);
    assert_eq!(config.pipeline.chunker.chunk_overlap, 8);
    assert_eq!(config.pipeline.chunker.strategy, SplitStrategy::Structural);
    assert_eq!(config.pipeline.schema.allowed_node_types.len(), 2);
    assert!(config.pipeline.qa.multi_step);
    assert_eq!(config.pipeline.model_retry.call_timeout, Duration::from_secs(30));
    assert!(config.pipeline.persist_chunks);
    assert_eq!(config.models.synthesis_model, "custom-model");
}

#[test]
fn app_config_invalid_numbers_fall_back_to_defaults() {
    let config = config_from(&[("SERVER_PORT", "not_a_number"), ("LATTICE_TOP_K", "-1")]);
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.pipeline.qa.top_k, 10);
}

#[test]
fn app_config_invalid_overlap_is_caught_by_validation() {
    let config = config_from(&[("LATTICE_CHUNK_SIZE", "10"), ("LATTICE_CHUNK_OVERLAP", "10")]);
    let err = config.pipeline.validate().unwrap_err();
    assert_eq!(err.reason_code(), "config_error");
}
