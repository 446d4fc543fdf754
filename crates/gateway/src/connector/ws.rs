//! WebSocket endpoint for the Cursor Connector agent.
//!
//! Flow:
//! 1. Agent connects to `/api/connector/ws?token=<pre-shared-token>`
//! 2. Agent sends `connector_hello`
//! 3. Hub responds with `hub_welcome`
//! 4. Bidirectional loop: hub sends `command_request`/`command_abort`/
//!    `verify_request`, agent answers with the matching responses; both
//!    exchange `ping`/`pong`

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use hub_protocol::WsMessage;

use crate::connector::ConnectorLink;
use crate::state::AppState;

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Pre-shared token for connector authentication.
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /api/connector/ws — upgrade to WebSocket.
///
/// Authentication: when `HUB_CONNECTOR_TOKEN` is set, the agent must
/// present it via the `token` query parameter; otherwise access is open
/// (dev mode).
pub async fn connector_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if !state.config.connector.enabled {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "connector is disabled by configuration",
        )
            .into_response();
    }

    if let Ok(expected) = std::env::var("HUB_CONNECTOR_TOKEN") {
        let provided = query.token.as_deref().unwrap_or("");
        if !token_eq(provided, &expected) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing connector token",
            )
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // 1. Wait for connector_hello.
    let connect_timeout =
        std::time::Duration::from_secs(state.config.connector.connect_timeout_secs);
    let hello = match wait_for_hello(&mut ws_stream, connect_timeout).await {
        Some(h) => h,
        None => {
            tracing::warn!("connector disconnected before sending connector_hello");
            return;
        }
    };

    // 2. Create the outbound channel and register the connection.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
    let session_id = state.link.attach(
        hello.connector_id.clone(),
        hello.version,
        outbound_tx,
    );

    // 3. Send hub_welcome.
    let welcome = WsMessage::HubWelcome {
        session_id: session_id.clone(),
        hub_version: env!("CARGO_PKG_VERSION").to_string(),
        heartbeat_interval_secs: state.config.connector.heartbeat_interval_secs,
    };
    if send_ws_message(&mut ws_sink, &welcome).await.is_err() {
        tracing::warn!(connector_id = %hello.connector_id, "failed to send hub_welcome");
        state.link.detach(&session_id);
        return;
    }

    // 4. Writer task: forward outbound channel messages to the WS sink.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_ws_message(&mut ws_sink, &msg).await.is_err() {
                break;
            }
        }
    });

    // 5. Reader loop.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(ws_msg) = serde_json::from_str::<WsMessage>(&text) {
                    handle_inbound(&state.link, ws_msg).await;
                } else {
                    tracing::debug!("ignoring unparseable connector message");
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                // axum answers WS-level pings automatically.
                state.link.touch();
            }
            _ => {}
        }
    }

    // 6. Cleanup.
    writer.abort();
    state.link.detach(&session_id);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct HelloData {
    connector_id: String,
    version: String,
}

async fn wait_for_hello(
    stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    deadline: std::time::Duration,
) -> Option<HelloData> {
    let result = tokio::time::timeout(deadline, async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(WsMessage::ConnectorHello {
                    connector_id,
                    version,
                    ..
                }) = serde_json::from_str::<WsMessage>(&text)
                {
                    return Some(HelloData {
                        connector_id,
                        version,
                    });
                }
            }
        }
        None
    })
    .await;

    result.unwrap_or(None)
}

async fn send_ws_message(
    sink: &mut (impl SinkExt<Message> + Unpin),
    msg: &WsMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn handle_inbound(link: &Arc<ConnectorLink>, msg: WsMessage) {
    link.touch();

    match msg {
        WsMessage::CommandResponse {
            command_id,
            success,
            response,
            error,
        } => {
            link.complete_command(command_id, success, response, error);
        }
        WsMessage::AbortAck { command_id } => {
            link.complete_abort(command_id);
        }
        WsMessage::VerifyResponse {
            request_id,
            ok,
            error,
        } => {
            link.complete_verify(request_id, ok, error);
        }
        WsMessage::Ping { timestamp } => {
            // Answer through the writer task.
            if let Some(sink) = link.current_sink() {
                let _ = sink.send(WsMessage::Pong { timestamp }).await;
            }
        }
        WsMessage::Pong { .. } => {
            // Heartbeat acknowledgment — touch already done above.
        }
        other => {
            tracing::debug!(
                msg_type = ?std::mem::discriminant(&other),
                "unexpected inbound connector message"
            );
        }
    }
}
