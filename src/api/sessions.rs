// Session tracking endpoints

use super::{run_blocking, ApiError, AppState};
use crate::models::{
    BufferSnapshot, SenderRole, SessionMetrics, SessionRecord, SessionStatus, SessionSummary,
};
use crate::tracker::MessageAppendResult;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body for POST /sessions
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session: SessionRecord,
    pub buffer: BufferSnapshot,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreatedResponse>), ApiError> {
    let response = run_blocking(state, move |tracker| {
        let session = tracker.create_session(&body.user_id, body.metadata)?;
        let buffer = tracker.get_buffer(&session.id)?;
        Ok(SessionCreatedResponse { session, buffer })
    })
    .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Query parameters for GET /sessions
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionRecord>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
    };
    let sessions = run_blocking(state, move |tracker| {
        tracker.list_sessions(query.user_id.as_deref(), status)
    })
    .await?;
    Ok(Json(SessionListResponse { sessions }))
}

#[derive(Debug, Serialize)]
pub struct SessionDetailResponse {
    pub session: SessionRecord,
    pub buffer: BufferSnapshot,
    pub metrics: SessionMetrics,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let response = run_blocking(state, move |tracker| {
        let session = tracker.get_session(&session_id)?;
        let buffer = tracker.get_buffer(&session_id)?;
        let metrics = tracker.get_metrics(&session_id)?;
        Ok(SessionDetailResponse {
            session,
            buffer,
            metrics,
        })
    })
    .await?;
    Ok(Json(response))
}

/// Request body for POST /sessions/:id/messages
#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub use_rag: Option<bool>,
    #[serde(default)]
    pub auto_reply: Option<bool>,
}

pub async fn append_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<AppendMessageRequest>,
) -> Result<(StatusCode, Json<MessageAppendResult>), ApiError> {
    let sender = SenderRole::parse(&body.sender)
        .ok_or_else(|| ApiError::bad_request(format!("unknown sender '{}'", body.sender)))?;
    let result = run_blocking(state, move |tracker| {
        tracker.append_message(
            &session_id,
            sender,
            &body.content,
            body.use_rag,
            body.auto_reply,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub summary: SessionSummary,
}

pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let summary =
        run_blocking(state, move |tracker| tracker.end_session(&session_id)).await?;
    Ok(Json(SummaryResponse { summary }))
}

pub async fn get_summary(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let summary =
        run_blocking(state, move |tracker| tracker.get_summary(&session_id)).await?;
    Ok(Json(SummaryResponse { summary }))
}
