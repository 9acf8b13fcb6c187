use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use lattice_core::graph::GraphStore;
use lattice_core::{AppConfig, GraphBackend};
use lattice_extraction::LlmExtractionPipeline;
use lattice_graph::{MemoryGraphStore, Neo4jGraphStore};
use lattice_llm::AnthropicModel;
use lattice_pipeline::Pipeline;

mod handlers;
mod routes;
mod state;

use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lattice=info".parse()?))
        .init();

    let config = AppConfig::from_env();
    config.pipeline.validate()?;
    let host = config.server_host.clone();
    let port = config.server_port;

    let graph: Arc<dyn GraphStore> = match config.graph_backend {
        GraphBackend::Neo4j => {
            let store = Neo4jGraphStore::new(&config).await;
            if !store.is_connected() {
                tracing::warn!("Graph endpoints will fail until the server is restarted with Neo4j reachable");
            }
            Arc::new(store)
        }
        GraphBackend::Memory => {
            tracing::info!("Using in-memory graph store");
            Arc::new(MemoryGraphStore::new())
        }
    };

    let extraction_model = Arc::new(AnthropicModel::from_config(&config, &config.models.extraction_model)?);
    let translation_model = Arc::new(AnthropicModel::from_config(&config, &config.models.translation_model)?);
    let synthesis_model = Arc::new(AnthropicModel::from_config(&config, &config.models.synthesis_model)?);

    let extractor = Arc::new(LlmExtractionPipeline::new(extraction_model).with_retry(config.pipeline.model_retry));
    let pipeline = Pipeline::new(
        graph,
        extractor,
        translation_model,
        synthesis_model,
        config.pipeline.clone(),
    );

    let state = AppState {
        graph_backend: config.graph_backend,
        config: Arc::new(config),
        pipeline: Arc::new(pipeline),
    };

    let app = routes::create_router()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{host}:{port}");
    tracing::info!("Lattice server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
