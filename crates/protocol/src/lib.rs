//! Connector protocol: WebSocket message types exchanged between the hub
//! and the Cursor Connector agent.
//!
//! The connector is a local automation agent that drives the IDE. It
//! connects to the hub, announces itself with `connector_hello`, and then
//! executes `command_request` messages, answering with `command_response`.
//! Both sides exchange `ping`/`pong` heartbeats.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hub_domain::command::{CommandKind, SshContext};

/// WebSocket message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Connector → Hub: initial handshake.
    #[serde(rename = "connector_hello")]
    ConnectorHello {
        connector_id: String,
        version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// Hub → Connector: handshake accepted.
    #[serde(rename = "hub_welcome")]
    HubWelcome {
        session_id: String,
        hub_version: String,
        /// Expected heartbeat cadence; the hub treats the link as
        /// unhealthy after two missed intervals.
        heartbeat_interval_secs: u64,
    },

    /// Hub → Connector: execute a command.
    #[serde(rename = "command_request")]
    CommandRequest(CommandEnvelope),

    /// Connector → Hub: command result.
    #[serde(rename = "command_response")]
    CommandResponse {
        command_id: Uuid,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Hub → Connector: stop executing a running command.
    #[serde(rename = "command_abort")]
    CommandAbort { command_id: Uuid },

    /// Connector → Hub: abort acknowledged.
    #[serde(rename = "abort_ack")]
    AbortAck { command_id: Uuid },

    /// Hub → Connector: probe an SSH endpoint for liveness.
    #[serde(rename = "verify_request")]
    VerifyRequest {
        request_id: Uuid,
        ssh: SshContext,
    },

    /// Connector → Hub: probe result.
    #[serde(rename = "verify_response")]
    VerifyResponse {
        request_id: Uuid,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Bidirectional: heartbeat.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Bidirectional: heartbeat response.
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// The command payload delivered to the connector. Carries the SSH
/// snapshot taken at enqueue time — the connector never resolves contexts
/// by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub task_id: Uuid,
    pub kind: CommandKind,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshContext>,
    pub timeout_seconds: u32,
}

/// Max command response payload size in bytes (4 MB). Connectors should
/// truncate results exceeding this.
pub const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_with_type_tag() {
        let msg = WsMessage::CommandResponse {
            command_id: Uuid::nil(),
            success: true,
            response: Some("ok".into()),
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"command_response\""));
        let parsed: WsMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WsMessage::CommandResponse { success: true, .. }));
    }

    #[test]
    fn command_envelope_carries_snapshot() {
        let envelope = CommandEnvelope {
            command_id: Uuid::nil(),
            task_id: Uuid::nil(),
            kind: CommandKind::Prompt,
            content: "open file".into(),
            metadata: serde_json::json!({"k": "v"}),
            ssh: Some(SshContext::new("dev", "h1")),
            timeout_seconds: 300,
        };
        let msg = WsMessage::CommandRequest(envelope);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"command_request\""));
        assert!(json.contains("\"host\":\"h1\""));

        let parsed: WsMessage = serde_json::from_str(&json).unwrap();
        let WsMessage::CommandRequest(env) = parsed else {
            panic!("expected command_request");
        };
        assert_eq!(env.ssh.unwrap().host, "h1");
    }

    #[test]
    fn hello_tolerates_missing_capabilities() {
        let json = r#"{"type":"connector_hello","connector_id":"c1","version":"0.1.0"}"#;
        let parsed: WsMessage = serde_json::from_str(json).unwrap();
        let WsMessage::ConnectorHello { capabilities, .. } = parsed else {
            panic!("expected connector_hello");
        };
        assert!(capabilities.is_empty());
    }
}
