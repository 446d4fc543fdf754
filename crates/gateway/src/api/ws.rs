//! Client-facing WebSocket endpoints.
//!
//! - `GET /api/cursor/tasks/:id/ws` — command channel: submit commands and
//!   watch their lifecycle in real time
//! - `GET /api/gemini/tasks/:id/ws` — LLM channel: send messages, receive
//!   complete or streamed replies
//! - `GET /api/events/ws`           — firehose of all hub events
//!
//! These are subscriber sockets fed by the event bus; a slow client drops
//! its oldest events rather than blocking producers.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use hub_domain::command::CommandKind;

use crate::runtime::broker::NewCommand;
use crate::runtime::context::ConversationRole;
use crate::runtime::events::HubEvent;
use crate::runtime::orchestrator::SendEvent;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CursorWsRequest {
    /// Ask for a one-shot connector status snapshot.
    Status,
    /// Enqueue a command and watch it to a terminal state.
    Command {
        #[serde(default = "d_prompt")]
        command_type: CommandKind,
        content: String,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
        #[serde(default)]
        ssh_context_id: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u32>,
    },
}

fn d_prompt() -> CommandKind {
    CommandKind::Prompt
}

#[derive(Debug, Deserialize)]
struct GeminiWsRequest {
    message: String,
    #[serde(default = "d_user")]
    role: ConversationRole,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

fn d_user() -> ConversationRole {
    ConversationRole::User
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> bool {
    let text = value.to_string();
    socket.send(Message::Text(text)).await.is_ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor command channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cursor_task_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| cursor_socket(socket, state, task_id))
}

async fn cursor_socket(mut socket: WebSocket, state: AppState, task_id: Uuid) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        let request = match serde_json::from_str::<CursorWsRequest>(&text) {
            Ok(req) => req,
            Err(e) => {
                let ok = send_json(
                    &mut socket,
                    serde_json::json!({"type": "error", "message": format!("invalid request: {e}")}),
                )
                .await;
                if !ok {
                    break;
                }
                continue;
            }
        };

        match request {
            CursorWsRequest::Status => {
                let ok = send_json(
                    &mut socket,
                    serde_json::json!({
                        "type": "status_update",
                        "task_id": task_id,
                        "status": state.broker.health(),
                    }),
                )
                .await;
                if !ok {
                    break;
                }
            }
            CursorWsRequest::Command {
                command_type,
                content,
                metadata,
                ssh_context_id,
                timeout_seconds,
            } => {
                // Subscribe before enqueueing so no lifecycle event is missed.
                let mut events = state.events.subscribe();
                let receipt = match state.broker.enqueue(NewCommand {
                    task_id,
                    kind: command_type,
                    content,
                    metadata,
                    ssh_context_id,
                    timeout_seconds,
                }) {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        let ok = send_json(
                            &mut socket,
                            serde_json::json!({"type": "error", "message": e.to_string()}),
                        )
                        .await;
                        if !ok {
                            break;
                        }
                        continue;
                    }
                };

                let ok = send_json(
                    &mut socket,
                    serde_json::json!({
                        "type": "command_queued",
                        "task_id": task_id,
                        "command_id": receipt.command_id,
                        "queue_position": receipt.queue_position,
                    }),
                )
                .await;
                if !ok {
                    break;
                }

                // Forward lifecycle events until the command goes terminal.
                while let Some(event) = events.next().await {
                    if event.command_id() != Some(receipt.command_id) {
                        continue;
                    }
                    let terminal = matches!(event, HubEvent::CommandTerminal { .. });
                    let ok = send_json(
                        &mut socket,
                        serde_json::json!({
                            "type": "command_status",
                            "task_id": task_id,
                            "command_id": receipt.command_id,
                            "event": event,
                        }),
                    )
                    .await;
                    if !ok {
                        return;
                    }
                    if terminal {
                        break;
                    }
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gemini LLM channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn gemini_task_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| gemini_socket(socket, state, task_id))
}

async fn gemini_socket(mut socket: WebSocket, state: AppState, task_id: Uuid) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        let request = match serde_json::from_str::<GeminiWsRequest>(&text) {
            Ok(req) => req,
            Err(e) => {
                let ok = send_json(
                    &mut socket,
                    serde_json::json!({"type": "error", "message": format!("invalid request: {e}")}),
                )
                .await;
                if !ok {
                    break;
                }
                continue;
            }
        };

        if request.stream {
            let mut rx = match state
                .orchestrator
                .send_stream(task_id, &request.message, request.role, request.metadata)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    let ok = send_json(
                        &mut socket,
                        serde_json::json!({"type": "error", "message": e.to_string()}),
                    )
                    .await;
                    if !ok {
                        break;
                    }
                    continue;
                }
            };

            if !send_json(
                &mut socket,
                serde_json::json!({"type": "stream_start", "task_id": task_id}),
            )
            .await
            {
                break;
            }

            while let Some(event) = rx.recv().await {
                let (payload, terminal) = match event {
                    SendEvent::Chunk(content) => (
                        serde_json::json!({"type": "stream_chunk", "content": content}),
                        false,
                    ),
                    SendEvent::Complete {
                        full_response,
                        model,
                    } => (
                        serde_json::json!({
                            "type": "stream_end",
                            "length": full_response.len(),
                            "full_response": full_response,
                            "model": model,
                        }),
                        true,
                    ),
                    SendEvent::Cancelled => (
                        serde_json::json!({"type": "stream_end", "cancelled": true, "length": 0}),
                        true,
                    ),
                    SendEvent::Failed { message } => (
                        serde_json::json!({"type": "error", "message": message}),
                        true,
                    ),
                };
                if !send_json(&mut socket, payload).await {
                    return;
                }
                if terminal {
                    break;
                }
            }
        } else {
            match state
                .orchestrator
                .send(task_id, &request.message, request.role, request.metadata)
                .await
            {
                Ok(outcome) => {
                    let ok = send_json(
                        &mut socket,
                        serde_json::json!({
                            "type": "complete_response",
                            "task_id": task_id,
                            "ai_response": outcome.reply,
                            "model": outcome.model,
                            "conversation_summary": outcome.conversation_summary,
                        }),
                    )
                    .await;
                    if !ok {
                        break;
                    }
                }
                Err(e) => {
                    let ok = send_json(
                        &mut socket,
                        serde_json::json!({"type": "error", "message": e.to_string()}),
                    )
                    .await;
                    if !ok {
                        break;
                    }
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event firehose
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| events_socket(socket, state))
}

async fn events_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    let mut reported_dropped: u64 = 0;

    while let Some(event) = events.next().await {
        let dropped = events.dropped();
        if dropped > reported_dropped {
            let warn = serde_json::json!({
                "type": "warning",
                "message": format!("missed {} events", dropped - reported_dropped),
            });
            reported_dropped = dropped;
            if !send_json(&mut socket, warn).await {
                return;
            }
        }
        if !send_json(&mut socket, serde_json::json!(event)).await {
            return;
        }
    }
}
