use std::sync::Arc;

use lattice_core::{AppConfig, GraphBackend};
use lattice_pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<Pipeline>,
    pub graph_backend: GraphBackend,
}
