//! Cursor Connector API endpoints — commands and SSH contexts.
//!
//! - `POST   /api/cursor/tasks/:id/command`        — enqueue a command
//! - `GET    /api/cursor/commands/:id/status`      — command snapshot
//! - `DELETE /api/cursor/commands/:id`             — cancel
//! - `POST   /api/cursor/ssh-contexts`             — create/replace
//! - `GET    /api/cursor/ssh-contexts`             — list
//! - `GET    /api/cursor/ssh-contexts/:id`         — read
//! - `DELETE /api/cursor/ssh-contexts/:id`         — delete
//! - `POST   /api/cursor/ssh-contexts/:id/verify`  — liveness probe
//! - `GET    /api/cursor/status` · `GET /api/cursor/health`

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use hub_domain::command::{CommandKind, SshContext};
use hub_domain::error::Error;

use crate::runtime::broker::NewCommand;
use crate::state::AppState;

use super::error::ApiResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command_type: CommandKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub ssh_context_id: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SshContextRequest {
    pub context_id: String,
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
}

fn d_port() -> u16 {
    22
}

impl From<SshContextRequest> for SshContext {
    fn from(req: SshContextRequest) -> Self {
        Self {
            id: req.context_id,
            host: req.host,
            port: req.port,
            username: req.username,
            key_path: req.key_path,
            working_directory: req.working_directory,
            environment: req.environment_vars,
            is_active: true,
            last_verified: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn send_command(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(body): Json<CommandRequest>,
) -> ApiResult<impl IntoResponse> {
    // The task must exist; commands are always task-scoped.
    state.engine.get(task_id).await?;

    let receipt = state.broker.enqueue(NewCommand {
        task_id,
        kind: body.command_type,
        content: body.content,
        metadata: body.metadata,
        ssh_context_id: body.ssh_context_id,
        timeout_seconds: body.timeout_seconds,
    })?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "command_id": receipt.command_id,
            "task_id": task_id,
            "status": "queued",
            "queue_position": receipt.queue_position,
            "ssh_context_used": receipt.ssh_context_used,
        })),
    ))
}

pub async fn command_status(
    State(state): State<AppState>,
    Path(command_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    match state.broker.status(command_id) {
        Some(command) => Ok(Json(command)),
        None => Err(Error::not_found("command", command_id.to_string()).into()),
    }
}

pub async fn cancel_command(
    State(state): State<AppState>,
    Path(command_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = state.broker.cancel(command_id)?;
    Ok(Json(serde_json::json!({
        "command_id": command_id,
        "cancelled": cancelled,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSH contexts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_ssh_context(
    State(state): State<AppState>,
    Json(body): Json<SshContextRequest>,
) -> ApiResult<impl IntoResponse> {
    let context = state.ssh.upsert(body.into())?;
    Ok((StatusCode::CREATED, Json(context)))
}

pub async fn list_ssh_contexts(State(state): State<AppState>) -> impl IntoResponse {
    let contexts = state.ssh.list();
    Json(serde_json::json!({
        "total": contexts.len(),
        "contexts": contexts,
    }))
}

pub async fn get_ssh_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.ssh.get(&context_id) {
        Some(context) => Ok(Json(context)),
        None => Err(Error::not_found("ssh_context", context_id).into()),
    }
}

pub async fn delete_ssh_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.ssh.remove(&context_id) {
        return Err(Error::not_found("ssh_context", context_id).into());
    }
    Ok(Json(serde_json::json!({
        "context_id": context_id,
        "deleted": true,
    })))
}

pub async fn verify_ssh_context(
    State(state): State<AppState>,
    Path(context_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let verified = state.broker.verify_ssh_context(&context_id).await?;
    Ok(Json(serde_json::json!({
        "context_id": context_id,
        "verified": verified,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status / health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn connector_status(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.broker.health();
    Json(serde_json::json!({
        "connector": state.link.info(),
        "health": health,
        "config": {
            "enabled": state.config.connector.enabled,
            "command_timeout_secs": state.config.connector.command_timeout_secs,
            "heartbeat_interval_secs": state.config.connector.heartbeat_interval_secs,
            "queue_max_size": state.config.connector.queue_max_size,
            "ssh_enabled": state.config.connector.ssh_enabled,
            "retention_window_secs": state.config.connector.retention_window_secs,
        },
    }))
}

pub async fn connector_health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.broker.health();
    let status = if health.is_connected && health.heartbeat_healthy {
        "healthy"
    } else if health.is_connected {
        "degraded"
    } else {
        "disconnected"
    };
    Json(serde_json::json!({
        "status": status,
        "is_connected": health.is_connected,
        "heartbeat_healthy": health.heartbeat_healthy,
        "queue_size": health.queue_size,
        "active_commands": health.active_commands,
        "expired_commands": health.expired_commands,
        "ssh_contexts": health.ssh_contexts,
    }))
}
