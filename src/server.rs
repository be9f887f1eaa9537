//! Thin HTTP surface: the progress WebSocket, health, and the trigger
//! endpoints the CLI and tests use. The full REST CRUD surface lives
//! outside the core.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::auth::TokenValidator;
use crate::errors::StageError;
use crate::orchestrator::{GenerationOptions, GenerationService};
use crate::progress::ProgressHub;
use crate::ratelimit::{SlidingWindowLimiter, rate_limit_middleware};

pub struct AppState {
    pub service: Arc<GenerationService>,
    pub progress: Arc<ProgressHub>,
    pub token_validator: Arc<dyn TokenValidator>,
    pub heartbeat_secs: u64,
}

pub fn build_router(state: Arc<AppState>, limiter: Arc<SlidingWindowLimiter>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::progress::ws::ws_handler))
        .route("/chapters", post(create_chapter))
        .route("/chapters/{id}", get(get_chapter))
        .route("/chapters/{id}/cancel", post(cancel_chapter))
        .layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Stable machine-readable error envelope; never leaks internals.
fn error_response(status: StatusCode, err: &StageError) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "kind": err.kind().as_str(),
            "message": err.user_message(),
        })),
    )
        .into_response()
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "kind": "unauthorized",
            "message": "a valid bearer token is required",
        })),
    )
        .into_response()
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    let user = state.token_validator.validate(token).await?;
    user.active.then_some(user.user_id)
}

#[derive(Debug, Deserialize)]
struct CreateChapterRequest {
    topic: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn create_chapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateChapterRequest>,
) -> axum::response::Response {
    let Some(user_id) = authenticate(&state, &headers).await else {
        return unauthorized();
    };
    match state.service.start_generation(
        &user_id,
        &request.topic,
        GenerationOptions { tags: request.tags },
    ) {
        Ok(chapter_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"chapter_id": chapter_id})),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err),
    }
}

async fn get_chapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let Some(user_id) = authenticate(&state, &headers).await else {
        return unauthorized();
    };
    match state.service.get_chapter(id) {
        Ok(chapter) if state.service.owned_by(&chapter, &user_id) => {
            Json(serde_json::to_value(&chapter).unwrap_or_default()).into_response()
        }
        Ok(_) => (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "kind": "forbidden",
                "message": "chapter belongs to another user",
            })),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, &err),
    }
}

async fn cancel_chapter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let Some(user_id) = authenticate(&state, &headers).await else {
        return unauthorized();
    };
    match state.service.get_chapter(id) {
        Ok(chapter) if !state.service.owned_by(&chapter, &user_id) => {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "kind": "forbidden",
                    "message": "chapter belongs to another user",
                })),
            )
                .into_response();
        }
        Err(err) => return error_response(StatusCode::NOT_FOUND, &err),
        Ok(_) => {}
    }
    match state.service.cancel(id) {
        Ok(()) => Json(serde_json::json!({"cancelled": true})).into_response(),
        Err(err) => error_response(StatusCode::CONFLICT, &err),
    }
}
