use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::info;

use lattice_core::api_types::HealthResponse;
use lattice_core::GraphBackend;

use crate::state::AppState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    info!("Health check requested");

    let graph = state.pipeline.store();
    let (graph_connected, node_count, edge_count) = match graph.node_count().await {
        Ok(nodes) => {
            let edges = graph.edge_count().await.unwrap_or(0);
            (true, nodes, edges)
        }
        Err(e) => {
            tracing::warn!("Graph connectivity check failed: {e}");
            (false, 0, 0)
        }
    };

    let status = if graph_connected { "ok" } else { "degraded" };
    let graph_backend = match state.graph_backend {
        GraphBackend::Neo4j => "neo4j",
        GraphBackend::Memory => "memory",
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: VERSION.to_string(),
        graph_backend: graph_backend.to_string(),
        graph_connected,
        node_count,
        edge_count,
    };

    (StatusCode::OK, Json(response))
}
