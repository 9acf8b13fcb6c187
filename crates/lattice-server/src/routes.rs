use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health::health_check))
        // Pipeline
        .route("/api/ingest", post(handlers::ingest::ingest_document))
        .route("/api/ask", post(handlers::ask::ask_question))
        // Graph
        .route("/api/graph/query", post(handlers::graph::query_graph))
        .route("/api/graph/schema", get(handlers::graph::graph_schema))
        .route("/api/graph/stats", get(handlers::graph::graph_stats))
        // Documents
        .route("/api/documents", get(handlers::documents::list_documents))
        .route("/api/documents/{id}/graph", get(handlers::documents::document_graph))
        .route("/api/documents/{id}/chunks", get(handlers::documents::list_chunks))
}
