use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::errors::ServiceError;
use crate::state::AppState;
use crate::translate::interface::{TranslateRequest, TranslateResponse};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .route("/translate", post(translate))
        .route("/api/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.config.translator.model_dir,
    }))
}

/// `POST /translate`: run the fixed English→Punjabi pipeline over the
/// request batch. The pipeline is compute-bound and synchronous, so it
/// runs on the blocking pool with a read-only handle on the engine.
async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> Result<Json<TranslateResponse>, ServiceError> {
    let sentences = request.sentences.unwrap_or_default();
    if sentences.is_empty() {
        return Err(ServiceError::InvalidInput);
    }
    info!(sentences = sentences.len(), "translate request");

    let engine = state.engine.clone();
    let translations =
        tokio::task::spawn_blocking(move || engine.translate(&sentences))
            .await
            .map_err(|e| ServiceError::ModelExecution(format!("translation task: {e}")))??;

    Ok(Json(TranslateResponse { translations }))
}
