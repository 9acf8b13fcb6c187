use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info};
use uuid::Uuid;

use lattice_core::api_types::{ChunkPageQuery, ChunkPageResponse, DocumentGraphResponse, DocumentListResponse};

use super::error_response;
use crate::state::AppState;

pub async fn list_documents(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.store().documents().await {
        Ok(documents) => (StatusCode::OK, Json(DocumentListResponse { documents })).into_response(),
        Err(e) => {
            error!("Failed to list documents: {e}");
            error_response(&e)
        }
    }
}

pub async fn document_graph(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    info!(%id, "Fetching document graph");

    match state.pipeline.store().document_graph(&[id]).await {
        Ok(graph) => (StatusCode::OK, Json(DocumentGraphResponse { document_id: id, graph })).into_response(),
        Err(e) => {
            error!("Failed to fetch graph for document {id}: {e}");
            error_response(&e)
        }
    }
}

pub async fn list_chunks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChunkPageQuery>,
) -> impl IntoResponse {
    info!(%id, page = query.page, "Fetching document chunks");

    match state.pipeline.store().chunk_page(id, query.page).await {
        Ok(page) => {
            let response = ChunkPageResponse {
                document_id: id,
                page: query.page,
                total_pages: page.total_pages,
                chunks: page.items,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!("Failed to fetch chunks for document {id}: {e}");
            error_response(&e)
        }
    }
}
