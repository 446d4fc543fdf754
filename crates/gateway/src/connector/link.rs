//! Connector link state.
//!
//! Tracks the single connected Cursor Connector agent: its outbound sink,
//! heartbeat freshness, and the pending request maps that pair
//! `command_request`/`command_response` and `verify_request`/
//! `verify_response` exchanges. Implements [`ConnectorTransport`] for the
//! broker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use hub_domain::command::SshContext;
use hub_domain::error::{Error, Result};
use hub_protocol::{CommandEnvelope, WsMessage};

use super::{CommandReply, ConnectorTransport};

/// Channel used to push messages to the connected agent's WS writer task.
pub type ConnectorSink = mpsc::Sender<WsMessage>;

struct ActiveConnection {
    connector_id: String,
    session_id: String,
    version: String,
    connected_at: DateTime<Utc>,
    sink: ConnectorSink,
}

/// Summary returned by status endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectorInfo {
    pub connector_id: String,
    pub session_id: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

pub struct ConnectorLink {
    connection: RwLock<Option<ActiveConnection>>,
    connected_tx: watch::Sender<bool>,
    last_heartbeat: RwLock<Option<DateTime<Utc>>>,
    pending_commands: Mutex<HashMap<Uuid, oneshot::Sender<CommandReply>>>,
    pending_aborts: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    pending_verifies: Mutex<HashMap<Uuid, oneshot::Sender<(bool, Option<String>)>>>,
}

impl ConnectorLink {
    pub fn new() -> Self {
        let (connected_tx, _rx) = watch::channel(false);
        Self {
            connection: RwLock::new(None),
            connected_tx,
            last_heartbeat: RwLock::new(None),
            pending_commands: Mutex::new(HashMap::new()),
            pending_aborts: Mutex::new(HashMap::new()),
            pending_verifies: Mutex::new(HashMap::new()),
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────

    /// Register a new agent connection, replacing any previous one
    /// (reconnect scenario). Returns the new session id.
    pub fn attach(&self, connector_id: String, version: String, sink: ConnectorSink) -> String {
        let session_id = Uuid::new_v4().to_string();
        let previous = self.connection.write().replace(ActiveConnection {
            connector_id: connector_id.clone(),
            session_id: session_id.clone(),
            version,
            connected_at: Utc::now(),
            sink,
        });
        if let Some(prev) = previous {
            tracing::warn!(
                connector_id = %prev.connector_id,
                "previous connector connection replaced"
            );
        }
        self.fail_pending("connector reconnected");
        *self.last_heartbeat.write() = Some(Utc::now());
        let _ = self.connected_tx.send(true);
        tracing::info!(connector_id = %connector_id, session_id = %session_id, "connector attached");
        session_id
    }

    /// Drop the connection if it still belongs to `session_id`.
    pub fn detach(&self, session_id: &str) {
        let mut connection = self.connection.write();
        let matches = connection
            .as_ref()
            .is_some_and(|c| c.session_id == session_id);
        if matches {
            let dropped = connection.take();
            drop(connection);
            let _ = self.connected_tx.send(false);
            let failed = self.fail_pending("connector disconnected");
            if let Some(c) = dropped {
                tracing::info!(
                    connector_id = %c.connector_id,
                    failed_in_flight = failed,
                    "connector detached"
                );
            }
        }
    }

    /// Update heartbeat freshness (called on ping/pong or any message).
    pub fn touch(&self) {
        *self.last_heartbeat.write() = Some(Utc::now());
    }

    pub fn info(&self) -> Option<ConnectorInfo> {
        self.connection.read().as_ref().map(|c| ConnectorInfo {
            connector_id: c.connector_id.clone(),
            session_id: c.session_id.clone(),
            version: c.version.clone(),
            connected_at: c.connected_at,
            last_heartbeat: *self.last_heartbeat.read(),
        })
    }

    /// Whether the last heartbeat is within twice the given interval.
    pub fn heartbeat_healthy(&self, interval_secs: u64) -> bool {
        self.last_heartbeat.read().is_some_and(|t| {
            Utc::now().signed_duration_since(t).num_seconds() <= 2 * interval_secs as i64
        })
    }

    /// Clone the current outbound sink, if an agent is connected.
    pub fn current_sink(&self) -> Option<ConnectorSink> {
        self.connection.read().as_ref().map(|c| c.sink.clone())
    }

    // ── Inbound message completion ─────────────────────────────────

    /// Resolve a pending delivery with the agent's response.
    pub fn complete_command(
        &self,
        command_id: Uuid,
        success: bool,
        response: Option<String>,
        error: Option<String>,
    ) {
        if let Some(tx) = self.pending_commands.lock().remove(&command_id) {
            let _ = tx.send(CommandReply {
                success,
                response,
                error,
            });
        } else {
            tracing::warn!(
                command_id = %command_id,
                "command_response for unknown request"
            );
        }
    }

    pub fn complete_abort(&self, command_id: Uuid) {
        if let Some(tx) = self.pending_aborts.lock().remove(&command_id) {
            let _ = tx.send(());
        }
    }

    pub fn complete_verify(&self, request_id: Uuid, ok: bool, error: Option<String>) {
        if let Some(tx) = self.pending_verifies.lock().remove(&request_id) {
            let _ = tx.send((ok, error));
        }
    }

    /// Fail all pending exchanges (disconnect). Returns how many command
    /// deliveries were failed.
    fn fail_pending(&self, reason: &str) -> usize {
        let commands: Vec<_> = {
            let mut pending = self.pending_commands.lock();
            pending.drain().collect()
        };
        let failed = commands.len();
        for (_, tx) in commands {
            let _ = tx.send(CommandReply {
                success: false,
                response: None,
                error: Some(reason.to_string()),
            });
        }
        self.pending_aborts.lock().clear();
        let verifies: Vec<_> = {
            let mut pending = self.pending_verifies.lock();
            pending.drain().collect()
        };
        for (_, tx) in verifies {
            let _ = tx.send((false, Some(reason.to_string())));
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending_commands.lock().len()
    }
}

impl Default for ConnectorLink {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ConnectorTransport for ConnectorLink {
    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.read()
    }

    async fn deliver(&self, envelope: CommandEnvelope) -> Result<CommandReply> {
        let command_id = envelope.command_id;
        let sink = self
            .current_sink()
            .ok_or_else(|| Error::external("connector", "not connected"))?;

        let (tx, rx) = oneshot::channel();
        self.pending_commands.lock().insert(command_id, tx);

        if sink
            .send(WsMessage::CommandRequest(envelope))
            .await
            .is_err()
        {
            self.pending_commands.lock().remove(&command_id);
            return Err(Error::external("connector", "send failed"));
        }

        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::external(
                "connector",
                "disconnected before responding",
            )),
        }
    }

    async fn abort(&self, command_id: Uuid) -> bool {
        // Whatever happens, stop waiting for the command's response.
        self.pending_commands.lock().remove(&command_id);

        let Some(sink) = self.current_sink() else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        self.pending_aborts.lock().insert(command_id, tx);

        if sink
            .send(WsMessage::CommandAbort { command_id })
            .await
            .is_err()
        {
            self.pending_aborts.lock().remove(&command_id);
            return false;
        }
        rx.await.is_ok()
    }

    async fn verify(&self, ssh: SshContext) -> Result<bool> {
        let sink = self
            .current_sink()
            .ok_or_else(|| Error::external("connector", "not connected"))?;

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_verifies.lock().insert(request_id, tx);

        if sink
            .send(WsMessage::VerifyRequest { request_id, ssh })
            .await
            .is_err()
        {
            self.pending_verifies.lock().remove(&request_id);
            return Err(Error::external("connector", "send failed"));
        }

        match rx.await {
            Ok((ok, error)) => {
                if let Some(error) = error {
                    tracing::debug!(error = %error, "ssh verification reported an error");
                }
                Ok(ok)
            }
            Err(_) => Err(Error::external(
                "connector",
                "disconnected before verify response",
            )),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::command::CommandKind;

    fn envelope() -> CommandEnvelope {
        CommandEnvelope {
            command_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            kind: CommandKind::Prompt,
            content: "do it".into(),
            metadata: serde_json::json!({}),
            ssh: None,
            timeout_seconds: 300,
        }
    }

    #[tokio::test]
    async fn deliver_without_connection_fails_fast() {
        let link = ConnectorLink::new();
        assert!(!link.is_connected());
        let err = link.deliver(envelope()).await.unwrap_err();
        assert!(matches!(err, Error::ExternalService { .. }));
    }

    #[tokio::test]
    async fn attach_flips_watch_and_heartbeat() {
        let link = ConnectorLink::new();
        let mut watch = link.connection_watch();
        assert!(!*watch.borrow_and_update());

        let (tx, _rx) = mpsc::channel(8);
        link.attach("cursor-1".into(), "0.1.0".into(), tx);

        assert!(link.is_connected());
        watch.changed().await.unwrap();
        assert!(*watch.borrow());
        assert!(link.last_heartbeat().is_some());
        assert_eq!(link.info().unwrap().connector_id, "cursor-1");
    }

    #[tokio::test]
    async fn deliver_roundtrip() {
        let link = std::sync::Arc::new(ConnectorLink::new());
        let (tx, mut rx) = mpsc::channel(8);
        link.attach("cursor-1".into(), "0.1.0".into(), tx);

        let env = envelope();

        // Connector side: answer the request as it arrives.
        let responder = {
            let link = link.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let WsMessage::CommandRequest(env) = msg else {
                    panic!("expected command_request");
                };
                link.complete_command(env.command_id, true, Some("opened".into()), None);
            })
        };

        let reply = link.deliver(env).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.response.as_deref(), Some("opened"));
        assert_eq!(link.pending_count(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn detach_fails_in_flight_deliveries() {
        let link = std::sync::Arc::new(ConnectorLink::new());
        let (tx, _rx) = mpsc::channel(8);
        let session = link.attach("cursor-1".into(), "0.1.0".into(), tx);

        let deliver = {
            let link = link.clone();
            tokio::spawn(async move { link.deliver(envelope()).await })
        };
        // Let the delivery register its pending entry.
        tokio::task::yield_now().await;

        link.detach(&session);
        let reply = deliver.await.unwrap().unwrap();
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("connector disconnected"));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn stale_session_detach_is_ignored() {
        let link = ConnectorLink::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let old_session = link.attach("cursor-1".into(), "0.1.0".into(), tx1);
        let (tx2, _rx2) = mpsc::channel(8);
        let _new_session = link.attach("cursor-1".into(), "0.2.0".into(), tx2);

        // The old connection's cleanup must not tear down the new one.
        link.detach(&old_session);
        assert!(link.is_connected());
        assert_eq!(link.info().unwrap().version, "0.2.0");
    }

    #[tokio::test]
    async fn abort_roundtrip_acks() {
        let link = std::sync::Arc::new(ConnectorLink::new());
        let (tx, mut rx) = mpsc::channel(8);
        link.attach("cursor-1".into(), "0.1.0".into(), tx);

        let command_id = Uuid::new_v4();
        let responder = {
            let link = link.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let WsMessage::CommandAbort { command_id } = msg else {
                    panic!("expected command_abort");
                };
                link.complete_abort(command_id);
            })
        };

        assert!(link.abort(command_id).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_health_window() {
        let link = ConnectorLink::new();
        assert!(!link.heartbeat_healthy(30));

        link.touch();
        assert!(link.heartbeat_healthy(30));

        // Stale heartbeat outside 2×interval.
        *link.last_heartbeat.write() =
            Some(Utc::now() - chrono::Duration::seconds(61));
        assert!(!link.heartbeat_healthy(30));
        assert!(link.heartbeat_healthy(3600));
    }

    #[tokio::test]
    async fn verify_roundtrip() {
        let link = std::sync::Arc::new(ConnectorLink::new());
        let (tx, mut rx) = mpsc::channel(8);
        link.attach("cursor-1".into(), "0.1.0".into(), tx);

        let responder = {
            let link = link.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let WsMessage::VerifyRequest { request_id, ssh } = msg else {
                    panic!("expected verify_request");
                };
                assert_eq!(ssh.host, "h1");
                link.complete_verify(request_id, true, None);
            })
        };

        let ok = link.verify(SshContext::new("dev", "h1")).await.unwrap();
        assert!(ok);
        responder.await.unwrap();
    }
}
