use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use lattice_core::api_types::{AskRequest, AskResponse};

use crate::state::AppState;

/// Always 200: unanswerable questions are a normal outcome, reported in the body.
#[instrument(skip(state), fields(question = %req.question))]
pub async fn ask_question(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> impl IntoResponse {
    let qa = req.qa.unwrap_or_else(|| state.config.pipeline.qa.clone());
    info!(multi_step = qa.multi_step, top_k = qa.top_k, "Received question");

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let answer = state.pipeline.ask(&req.question, &qa, cancel).await;
    let response: AskResponse = answer.into();
    info!(
        outcome = ?response.outcome,
        rows = response.used_context.len(),
        "Question answered"
    );
    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use lattice_core::{AnswerOutcome, PipelineConfig};
    use lattice_llm::{ScriptedModel, ScriptedReply};

    use super::*;
    use crate::handlers::test_support::{body_json, state_with};

    #[tokio::test]
    async fn untranslatable_question_is_unanswerable() {
        let qa = ScriptedModel::new().with_fallback(ScriptedReply::text("no idea"));
        let state = state_with(ScriptedModel::new(), qa, PipelineConfig::default());

        let req = AskRequest {
            question: "Who founded Acme?".into(),
            qa: None,
        };
        let response = ask_question(State(state), Json(req)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body: AskResponse = body_json(response).await;
        assert!(!body.answer.is_empty());
        assert!(body.used_context.is_empty());
        assert!(matches!(body.outcome, AnswerOutcome::Unanswerable { .. }));
    }
}
