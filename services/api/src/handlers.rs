//! Axum Handlers for the REST API
//!
//! Health reporting and the call control surface. It uses `utoipa` doc
//! comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    models::{CallSessionSummary, EndStreamResponse, ErrorResponse, HealthResponse, StreamSummary},
    state::AppState,
};

pub enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Internal(e) => {
                error!(error = ?e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        message: "Internal server error".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// Report service liveness.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_streams: state.registry().len(),
        observers: state.broadcaster.observer_count(),
        store: match state.config.database_url {
            Some(_) => "postgres",
            None => "memory",
        }
        .to_string(),
    })
}

/// List persisted calls, most recent first.
#[utoipa::path(
    get,
    path = "/api/calls",
    responses(
        (status = 200, description = "Call history", body = [CallSessionSummary]),
        (status = 500, description = "Call store unavailable", body = ErrorResponse)
    )
)]
pub async fn list_calls(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CallSessionSummary>>, ApiError> {
    let calls = state
        .sessions
        .store
        .list_call_sessions()
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(calls.into_iter().map(CallSessionSummary::from).collect()))
}

/// List the media streams currently bridged to a voice agent, oldest first.
#[utoipa::path(
    get,
    path = "/api/streams",
    responses(
        (status = 200, description = "Active streams", body = [StreamSummary])
    )
)]
pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<Vec<StreamSummary>> {
    Json(
        state
            .registry()
            .snapshot()
            .into_iter()
            .map(StreamSummary::from)
            .collect(),
    )
}

/// End the call streaming on `stream_sid`.
///
/// The request is handed to the owning session, which winds the call down on
/// its own; the response does not wait for that to finish.
#[utoipa::path(
    post,
    path = "/api/streams/{stream_sid}/end",
    params(
        ("stream_sid" = String, Path, description = "Stream identifier announced in the start frame")
    ),
    responses(
        (status = 202, description = "Hangup delivered to the session", body = EndStreamResponse),
        (status = 404, description = "No active stream with this identifier", body = ErrorResponse)
    )
)]
pub async fn end_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_sid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state
        .registry()
        .lookup(&stream_sid)
        .ok_or_else(|| ApiError::NotFound(format!("Stream {} not found", stream_sid)))?;

    if !handle.end_call() {
        warn!(%stream_sid, session_id = %handle.session_id, "stale registry entry");
        state
            .registry()
            .remove_if_current(&stream_sid, handle.session_id);
        return Err(ApiError::NotFound(format!(
            "Stream {} is no longer active",
            stream_sid
        )));
    }

    info!(%stream_sid, session_id = %handle.session_id, "hangup requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(EndStreamResponse {
            stream_sid,
            session_id: handle.session_id,
            status: "ending".to_string(),
        }),
    ))
}
