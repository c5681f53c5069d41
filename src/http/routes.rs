//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::warn;
use uuid::Uuid;

use crate::app::AppState;
use crate::matchmaking::{HandoffError, MatchHandoff};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/matches", post(create_match_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_players: state.match_registry.total_players(),
    })
}

// ============================================================================
// Matchmaking handoff
// ============================================================================

#[derive(Serialize)]
struct CreateMatchResponse {
    match_id: Uuid,
    ws_path: String,
}

async fn create_match_handler(
    State(state): State<AppState>,
    Json(handoff): Json<MatchHandoff>,
) -> Result<(StatusCode, Json<CreateMatchResponse>), AppError> {
    let match_id = state.match_service.start_match(handoff).map_err(|e| {
        warn!(error = %e, "Rejected match handoff");
        AppError::from(e)
    })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMatchResponse {
            match_id,
            ws_path: format!("/ws?match_id={match_id}&player_id={{player_id}}"),
        }),
    ))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<HandoffError> for AppError {
    fn from(err: HandoffError) -> Self {
        match err {
            HandoffError::DuplicateMatch(_) => AppError::Conflict(err.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_errors_map_to_status() {
        let dup: AppError = HandoffError::DuplicateMatch(Uuid::nil()).into();
        assert_eq!(dup.into_response().status(), StatusCode::CONFLICT);

        let bad: AppError = HandoffError::InvalidBounds.into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
