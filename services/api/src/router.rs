//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the control API, both WebSocket endpoints, and the OpenAPI
//! document.

use crate::{
    handlers,
    models::{CallSessionSummary, EndStreamResponse, ErrorResponse, HealthResponse, StreamSummary},
    state::AppState,
    ws::{media_handler, observer_handler},
};

use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_streams,
        handlers::end_stream,
        handlers::list_calls,
    ),
    components(
        schemas(
            HealthResponse,
            StreamSummary,
            EndStreamResponse,
            CallSessionSummary,
            ErrorResponse
        )
    ),
    tags(
        (name = "Call Bridge API", description = "Control surface for calls bridged to a voice agent")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/streams", get(handlers::list_streams))
        .route("/api/streams/{stream_sid}/end", post(handlers::end_stream))
        .route("/api/calls", get(handlers::list_calls))
        .route("/media", get(media_handler))
        .route("/ws", get(observer_handler))
        .with_state(app_state);

    Router::new()
        .route("/api-docs/openapi.json", get(openapi_json))
        .merge(api_router)
}
