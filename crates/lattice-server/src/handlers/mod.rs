pub mod ask;
pub mod documents;
pub mod graph;
pub mod health;
pub mod ingest;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use lattice_core::api_types::ErrorResponse;
use lattice_core::error::LatticeError;

/// Map a pipeline error onto an HTTP status and a JSON error body.
pub(crate) fn error_response(err: &LatticeError) -> Response {
    let status = match err {
        LatticeError::Config(_) | LatticeError::QueryExecution(_) => StatusCode::BAD_REQUEST,
        LatticeError::NotFound(_) => StatusCode::NOT_FOUND,
        LatticeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        LatticeError::ModelUnavailable(_) | LatticeError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error: err.to_string(),
        reason_code: err.reason_code().to_string(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::response::Response;
    use serde::de::DeserializeOwned;

    use lattice_core::{AppConfig, GraphBackend, PipelineConfig};
    use lattice_extraction::LlmExtractionPipeline;
    use lattice_graph::MemoryGraphStore;
    use lattice_llm::ScriptedModel;
    use lattice_pipeline::Pipeline;

    use crate::state::AppState;

    pub fn state_with(extraction: ScriptedModel, qa: ScriptedModel, config: PipelineConfig) -> AppState {
        let app_config = AppConfig::from_lookup(|key| match key {
            "GRAPH_BACKEND" => Some("memory".to_string()),
            _ => None,
        });
        let qa = Arc::new(qa);
        let extractor = Arc::new(LlmExtractionPipeline::new(Arc::new(extraction)));
        let pipeline = Pipeline::new(
            Arc::new(MemoryGraphStore::new()),
            extractor,
            qa.clone(),
            qa,
            config,
        );
        AppState {
            config: Arc::new(app_config),
            pipeline: Arc::new(pipeline),
            graph_backend: GraphBackend::Memory,
        }
    }

    pub async fn body_json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
