use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use hub_domain::config::Config;
use hub_domain::error::Result;
use hub_domain::task::Task;
use hub_providers::GenerativeClient;
use hub_store::TaskStore;

use crate::connector::{ConnectorLink, ConnectorTransport};
use crate::runtime::broker::CommandBroker;
use crate::runtime::engine::TaskEngine;
use crate::runtime::events::EventBus;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::ssh::SshContextRegistry;

/// Shared application state passed to all API handlers.
///
/// Every collaborator is an explicit handle constructed at startup and
/// threaded through here — no process-wide mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn TaskStore>,
    pub engine: Arc<TaskEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub broker: Arc<CommandBroker>,
    pub ssh: Arc<SshContextRegistry>,
    pub events: Arc<EventBus>,
    /// The Cursor Connector link (the production transport).
    pub link: Arc<ConnectorLink>,
    pub started_at: DateTime<Utc>,
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Wire up the full collaborator graph. `transport` is the broker's
    /// delivery seam — in production it is `link`, in tests a scripted
    /// double.
    pub fn build(
        config: Arc<Config>,
        store: Arc<dyn TaskStore>,
        llm: Arc<dyn GenerativeClient>,
        transport: Arc<dyn ConnectorTransport>,
        link: Arc<ConnectorLink>,
    ) -> Self {
        let events = Arc::new(EventBus::new(1024));
        let engine = Arc::new(TaskEngine::new(
            store.clone(),
            events.clone(),
            config.tasks.retry_attempts,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            llm,
            engine.clone(),
            events.clone(),
            config.llm.clone(),
        ));
        let ssh = Arc::new(SshContextRegistry::new(config.connector.ssh_enabled));
        let broker = Arc::new(CommandBroker::new(
            config.connector.clone(),
            transport,
            ssh.clone(),
            events.clone(),
        ));

        let api_token_hash = match std::env::var(&config.server.api_token_env) {
            Ok(token) if !token.is_empty() => Some(Sha256::digest(token.as_bytes()).to_vec()),
            _ => None,
        };

        Self {
            config,
            store,
            engine,
            orchestrator,
            broker,
            ssh,
            events,
            link,
            started_at: Utc::now(),
            api_token_hash,
        }
    }

    /// Cancel a task and everything in flight for it: queued and running
    /// commands, plus the current orchestrator send (a running stream
    /// terminates with its end-of-stream marker).
    pub async fn cancel_task_cascade(&self, task_id: Uuid) -> Result<Task> {
        let task = self.engine.cancel(task_id).await?;
        let commands_cancelled = self.broker.cancel_for_task(task_id);
        let send_cancelled = self.orchestrator.cancel_send(task_id);
        tracing::info!(
            task_id = %task_id,
            commands_cancelled,
            send_cancelled,
            "task cancelled"
        );
        Ok(task)
    }

    pub fn uptime_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds()
    }
}
