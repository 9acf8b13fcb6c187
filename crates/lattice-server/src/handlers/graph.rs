use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info};

use lattice_core::api_types::{
    GraphQueryRequest, GraphQueryResponse, GraphSchemaResponse, GraphStatsResponse,
};
use lattice_core::error::LatticeError;
use lattice_core::cypher;

use super::error_response;
use crate::state::AppState;

/// Run a caller-supplied read query. Write clauses are rejected before the
/// store sees the text.
pub async fn query_graph(
    State(state): State<AppState>,
    Json(request): Json<GraphQueryRequest>,
) -> impl IntoResponse {
    info!(cypher = %request.cypher, "Executing graph query");

    if let Err(e) = cypher::validate(&request.cypher) {
        let err = LatticeError::QueryExecution(format!("invalid query: {e}"));
        return error_response(&err);
    }

    match state.pipeline.store().query(&request.cypher).await {
        Ok(rows) => (StatusCode::OK, Json(GraphQueryResponse { rows })).into_response(),
        Err(e) => {
            error!("Graph query failed: {e}");
            error_response(&e)
        }
    }
}

pub async fn graph_schema(State(state): State<AppState>) -> impl IntoResponse {
    info!("Fetching graph schema");

    match state.pipeline.store().schema().await {
        Ok(schema) => {
            let description = schema.describe();
            (StatusCode::OK, Json(GraphSchemaResponse { schema, description })).into_response()
        }
        Err(e) => {
            error!("Failed to introspect graph schema: {e}");
            error_response(&e)
        }
    }
}

pub async fn graph_stats(State(state): State<AppState>) -> impl IntoResponse {
    info!("Fetching graph statistics");

    let graph = state.pipeline.store();
    let node_count = match graph.node_count().await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to get node count: {e}");
            return error_response(&e);
        }
    };

    let edge_count = match graph.edge_count().await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to get edge count: {e}");
            return error_response(&e);
        }
    };

    let (node_types, relation_types) = match graph.schema().await {
        Ok(schema) => (schema.node_types.len(), schema.relation_types.len()),
        Err(e) => {
            tracing::warn!("Failed to fetch type statistics: {e}");
            (0, 0)
        }
    };

    let response = GraphStatsResponse {
        node_count,
        edge_count,
        node_types,
        relation_types,
    };

    (StatusCode::OK, Json(response)).into_response()
}
