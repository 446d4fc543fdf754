pub mod link;
pub mod ws;

pub use link::ConnectorLink;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use hub_domain::command::SshContext;
use hub_domain::error::Result;
use hub_protocol::CommandEnvelope;

/// Reply to a delivered command, as reported by the connector.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

/// The broker's view of the link to one Cursor Connector agent.
///
/// Connectionful: the link may be down, in which case `deliver` fails fast
/// and the dispatcher parks on `connection_watch` until it comes back.
/// Timeout policy belongs to the caller, not the transport.
#[async_trait::async_trait]
pub trait ConnectorTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Watch channel holding the current connectivity bit.
    fn connection_watch(&self) -> watch::Receiver<bool>;

    fn last_heartbeat(&self) -> Option<DateTime<Utc>>;

    /// Deliver a command and wait for the connector's reply.
    async fn deliver(&self, envelope: CommandEnvelope) -> Result<CommandReply>;

    /// Ask the connector to abort a running command. Returns whether the
    /// abort was acknowledged.
    async fn abort(&self, command_id: Uuid) -> bool;

    /// Probe an SSH endpoint for liveness through the connector.
    async fn verify(&self, ssh: SshContext) -> Result<bool>;
}
