//! Task API endpoints — CRUD, listing, messages, and lifecycle moves.
//!
//! - `POST   /api/tasks`               — create
//! - `GET    /api/tasks`               — list (filters + pagination)
//! - `GET    /api/tasks/:id`           — read (optionally with messages)
//! - `PUT    /api/tasks/:id`           — update editable fields
//! - `DELETE /api/tasks/:id`           — soft-delete
//! - `GET    /api/tasks/:id/messages`  — persisted conversation record
//! - `POST   /api/tasks/:id/{start,complete,cancel,retry}`

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use hub_domain::task::{TaskPriority, TaskStatus, TaskTurn};
use hub_store::{TaskFilter, TaskPatch};

use crate::runtime::engine::TaskDraft;
use crate::state::AppState;

use super::error::ApiResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub current_turn: Option<TaskTurn>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_remote_ssh: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
}

fn d_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct GetTaskQuery {
    #[serde(default)]
    pub include_messages: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CRUD
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_task(
    State(state): State<AppState>,
    Json(draft): Json<TaskDraft>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.create(draft).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = TaskFilter {
        search: q.search,
        status: q.status,
        priority: q.priority,
        current_turn: q.current_turn,
        created_by: q.created_by,
        created_after: q.created_after,
        created_before: q.created_before,
        is_remote_ssh: q.is_remote_ssh,
    };
    let limit = q.limit.min(200);
    let page = state.engine.list(&filter, q.skip, limit).await?;
    Ok(Json(page))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(q): Query<GetTaskQuery>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.get(task_id).await?;
    if q.include_messages {
        let messages = state.engine.messages(task_id).await?;
        return Ok(Json(serde_json::json!({
            "task": task,
            "messages": messages,
        }))
        .into_response());
    }
    Ok(Json(task).into_response())
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.update(task_id, patch).await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.delete(task_id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_task_messages(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let messages = state.engine.messages(task_id).await?;
    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "messages": messages,
        "total": messages.len(),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.start(task_id).await?;
    Ok(Json(task))
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.complete(task_id).await?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.cancel_task_cascade(task_id).await?;
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.engine.retry(task_id).await?;
    Ok(Json(task))
}
