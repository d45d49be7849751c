use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::services::ServeDir;
use tracing::{error, info, info_span};
use uuid::Uuid;

use super::types::*;
use super::AppState;
use crate::error::InferenceError;
use crate::solver;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/solve", post(solve))
        .route("/api/reset", post(reset))
        .fallback_service(ServeDir::new(&state.web_dir))
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.cache.status().into())
}

async fn solve(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    // accept any content type, like the browser front end sends
    let request: SolveRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
                .into_response()
        }
    };

    let question = request.question().to_string();
    let max_new_tokens = request.max_new_tokens();
    if let Err(e) = solver::validate(&question, max_new_tokens) {
        return error_response(e);
    }

    let request_id = Uuid::new_v4();
    info!(
        "Solve request {}: question_len={}, max_new_tokens={}",
        request_id,
        question.len(),
        max_new_tokens
    );

    let cache = Arc::clone(&state.cache);
    let span = info_span!("solve", %request_id, model = %state.model_id);
    let result = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let handle = cache.get()?;
        solver::solve(&question, max_new_tokens, &handle)
    })
    .await;

    match result {
        Ok(Ok(output)) => Json(SolveResponse { output }).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            error!("Solve task for {} panicked: {}", request_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Generation failed: worker task aborted".to_string(),
            )
                .into_response()
        }
    }
}

/// Clears a cached load failure so the next solve retries the load.
async fn reset(State(state): State<Arc<AppState>>) -> Response {
    let cache = Arc::clone(&state.cache);
    match tokio::task::spawn_blocking(move || {
        cache.reset();
        cache.status()
    })
    .await
    {
        Ok(status) => Json(StatusResponse::from(status)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn error_response(e: InferenceError) -> Response {
    match e {
        InferenceError::Validation(message) => {
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        InferenceError::CachedLoad(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Model failed to load: {}", message),
        )
            .into_response(),
        InferenceError::Generation(message) => {
            error!("Generation error: {}", message);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Generation failed: {}", message),
            )
                .into_response()
        }
        other => {
            error!("Generation error: {}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Generation failed: {}", other),
            )
                .into_response()
        }
    }
}
