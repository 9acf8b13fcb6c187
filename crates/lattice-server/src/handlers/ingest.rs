use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use lattice_core::api_types::{IngestRequest, IngestResponse};
use lattice_core::Document;

use super::error_response;
use crate::state::AppState;

fn build_document(req: IngestRequest) -> Document {
    let mut document = if req.pages.is_empty() {
        Document::new(req.source_type, req.text)
    } else {
        Document::from_pages(req.source_type, &req.pages)
    };
    document.title = req.title;
    document.source_uri = req.source_uri;
    if !req.metadata.is_null() {
        document.metadata = req.metadata;
    }
    document
}

#[instrument(skip_all, fields(source_type = ?req.source_type))]
pub async fn ingest_document(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let defaults = &state.config.pipeline;
    let chunker = req.chunker.clone().unwrap_or_else(|| defaults.chunker.clone());
    let schema = req.schema.clone().unwrap_or_else(|| defaults.schema.clone());
    let document = build_document(req);
    info!(document_id = %document.id, bytes = document.raw_text.len(), "Received document");

    // Dropping the handler future (client went away) cancels the run.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.pipeline.ingest(&document, &chunker, &schema, cancel).await {
        Ok(result) => {
            let response = IngestResponse {
                document_id: document.id,
                result,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Ingestion failed");
            error_response(&e)
        }
    }
}
