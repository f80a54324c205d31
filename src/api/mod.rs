// HTTP API module - exposes session tracking via REST endpoints
//
// All endpoints return JSON. The tracker core is synchronous (SQLite plus a
// blocking pipeline client), so every handler hops to a blocking task before
// touching it. Binds to 127.0.0.1 by default (localhost only).

mod sessions;

pub use sessions::{
    append_message, create_session, end_session, get_session, get_summary, list_sessions,
};

use crate::tracker::{SessionError, SessionTracker};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

/// Shared tracker handle for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<SessionTracker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/messages", post(append_message))
        .route("/sessions/:id/end", post(end_session))
        .route("/sessions/:id/summary", get(get_summary))
        .with_state(state)
}

/// API-level error carrying the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        let status = match &error {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Closed(_) => StatusCode::CONFLICT,
            SessionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SessionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("API error: {} - {}", self.status, self.message);
        }
        (
            self.status,
            Json(json!({
                "error": self.message,
                "status": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

/// Run a tracker operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(state: AppState, operation: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SessionTracker) -> Result<T, SessionError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || operation(&state.tracker))
        .await
        .map_err(|e| ApiError::internal(format!("task join failed: {e}")))?
        .map_err(ApiError::from)
}
