//! Conversation API endpoints (the "Gemini" surface).
//!
//! - `POST   /api/gemini/tasks/:id/message`      — complete send
//! - `POST   /api/gemini/tasks/:id/stream`       — chunked text stream
//! - `POST   /api/gemini/tasks/:id/conversation` — (re)create context
//! - `GET    /api/gemini/tasks/:id/conversation` — summary
//! - `DELETE /api/gemini/tasks/:id/conversation` — clear
//! - `GET    /api/gemini/health`                 — orchestrator probe

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use hub_domain::error::Error;

use crate::runtime::context::ConversationRole;
use crate::runtime::orchestrator::SendEvent;
use crate::state::AppState;

use super::error::ApiResult;

/// Terminal marker closing every successful or cancelled stream.
pub const STREAM_DONE_MARKER: &str = "[DONE]";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default = "d_user_role")]
    pub role: ConversationRole,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn d_user_role() -> ConversationRole {
    ConversationRole::User
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Send (complete)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn send_message(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .orchestrator
        .send(task_id, &body.message, body.role, body.metadata)
        .await?;

    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "user_message": body.message,
        "ai_response": outcome.reply,
        "model": outcome.model,
        "conversation_summary": outcome.conversation_summary,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Send (streaming)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chunked text stream. Chunks are raw model text; the stream always ends
/// with `[DONE]` (success or cancel) or `[ERROR: …]` on failure. Partial
/// output before an error is never persisted.
pub async fn stream_message(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let mut rx = state
        .orchestrator
        .send_stream(task_id, &body.message, body.role, body.metadata)
        .await?;

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match event {
                SendEvent::Chunk(text) => {
                    yield Ok::<_, std::convert::Infallible>(text.into_bytes());
                }
                SendEvent::Complete { .. } | SendEvent::Cancelled => {
                    yield Ok(format!("\n{STREAM_DONE_MARKER}\n").into_bytes());
                    break;
                }
                SendEvent::Failed { message } => {
                    yield Ok(format!("\n[ERROR: {message}]\n").into_bytes());
                    break;
                }
            }
        }
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Internal(format!("failed to build stream response: {e}")))?;
    Ok(response)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_conversation(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    body: Option<Json<CreateConversationRequest>>,
) -> ApiResult<impl IntoResponse> {
    // The task must exist before a conversation can be attached to it.
    state.engine.get(task_id).await?;

    let system_prompt = body.and_then(|Json(b)| b.system_prompt);
    let summary = state.orchestrator.create_conversation(task_id, system_prompt);
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn conversation_summary(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    match state.orchestrator.conversation_summary(task_id) {
        Some(summary) => Ok(Json(summary)),
        None => Err(Error::not_found("conversation", task_id.to_string()).into()),
    }
}

pub async fn clear_conversation(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cleared = state.orchestrator.clear(task_id);
    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "cleared": cleared,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.health().await)
}
