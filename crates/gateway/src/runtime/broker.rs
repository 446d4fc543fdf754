//! Connector command broker.
//!
//! Bounded FIFO queue of commands bound for the Cursor Connector, drained
//! by exactly one dispatcher. Commands are admitted while the link is
//! down (up to the queue bound); the dispatcher parks until the link is
//! healthy. Terminal states are write-once and retained for a window so
//! late status queries still resolve.
//!
//! Lock ordering: queue before command table, everywhere.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hub_domain::command::{
    validate_command_content, validate_command_metadata, Command, CommandKind, CommandStatus,
    COMMAND_TIMEOUT_MAX_SECS, COMMAND_TIMEOUT_MIN_SECS,
};
use hub_domain::config::ConnectorConfig;
use hub_domain::error::{Error, Result};
use hub_protocol::CommandEnvelope;

use crate::connector::ConnectorTransport;

use super::cancel::CancelMap;
use super::events::{EventBus, HubEvent};
use super::ssh::SshContextRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / receipt / health shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub task_id: Uuid,
    pub kind: CommandKind,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub ssh_context_id: Option<String>,
    pub timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub command_id: Uuid,
    pub queue_position: usize,
    pub ssh_context_used: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub is_connected: bool,
    pub heartbeat_healthy: bool,
    pub queue_size: usize,
    pub active_commands: usize,
    /// Terminal commands past the retention window, not yet reaped.
    pub expired_commands: usize,
    pub ssh_contexts: usize,
    pub queue_max_size: usize,
    pub retention_window_secs: u64,
}

enum Terminal {
    Completed(Option<String>),
    Failed(String),
    Timeout(String),
    Cancelled,
}

enum Attempt {
    Success(Option<String>),
    Failure { message: String, timed_out: bool },
    Cancelled,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CommandBroker {
    config: ConnectorConfig,
    transport: Arc<dyn ConnectorTransport>,
    ssh: Arc<SshContextRegistry>,
    events: Arc<EventBus>,
    commands: RwLock<HashMap<Uuid, Command>>,
    queue: Mutex<VecDeque<Uuid>>,
    queued_notify: Notify,
    cancels: CancelMap,
}

impl CommandBroker {
    pub fn new(
        config: ConnectorConfig,
        transport: Arc<dyn ConnectorTransport>,
        ssh: Arc<SshContextRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            transport,
            ssh,
            events,
            commands: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queued_notify: Notify::new(),
            cancels: CancelMap::new(),
        }
    }

    pub fn ssh_registry(&self) -> &Arc<SshContextRegistry> {
        &self.ssh
    }

    // ── Enqueue ────────────────────────────────────────────────────

    pub fn enqueue(&self, new: NewCommand) -> Result<EnqueueReceipt> {
        if !self.config.enabled {
            return Err(Error::BusinessLogic(
                "the connector is disabled by configuration".into(),
            ));
        }

        let content = validate_command_content(&new.content)?;
        if let Some(ref metadata) = new.metadata {
            validate_command_metadata(metadata)?;
        }
        let timeout_seconds = new
            .timeout_seconds
            .unwrap_or(self.config.command_timeout_secs);
        if !(COMMAND_TIMEOUT_MIN_SECS..=COMMAND_TIMEOUT_MAX_SECS).contains(&timeout_seconds) {
            return Err(Error::validation(format!(
                "timeout_seconds must be {COMMAND_TIMEOUT_MIN_SECS}..={COMMAND_TIMEOUT_MAX_SECS}"
            )));
        }

        // Snapshot the SSH context now; later edits never reach this command.
        let ssh_context = match new.ssh_context_id {
            Some(ref id) => {
                if !self.config.ssh_enabled {
                    return Err(Error::BusinessLogic(
                        "SSH contexts are disabled by configuration".into(),
                    ));
                }
                Some(
                    self.ssh
                        .get(id)
                        .ok_or_else(|| Error::not_found("ssh_context", id.clone()))?,
                )
            }
            None => None,
        };
        let ssh_context_used = ssh_context.is_some();

        let mut command = Command::new(new.task_id, new.kind, content);
        command.max_retries = self.config.max_retries;
        command.timeout_seconds = timeout_seconds;
        command.metadata = new.metadata.unwrap_or_else(|| serde_json::json!({}));
        command.ssh_context = ssh_context;
        let command_id = command.id;
        let task_id = command.task_id;

        let queue_position = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.queue_max_size {
                return Err(Error::BusinessLogic(format!(
                    "command queue is full ({} commands)",
                    queue.len()
                )));
            }
            self.commands.write().insert(command_id, command);
            queue.push_back(command_id);
            queue.len()
        };

        self.cancels.register(command_id);
        self.queued_notify.notify_one();
        self.events.publish(HubEvent::CommandQueued {
            command_id,
            task_id,
            queue_position,
        });
        tracing::info!(
            command_id = %command_id,
            task_id = %task_id,
            queue_position,
            ssh = ssh_context_used,
            "command queued"
        );

        Ok(EnqueueReceipt {
            command_id,
            queue_position,
            ssh_context_used,
        })
    }

    // ── Status reads ───────────────────────────────────────────────

    /// Point-in-time snapshot of one command.
    pub fn status(&self, command_id: Uuid) -> Option<Command> {
        self.commands.read().get(&command_id).cloned()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn health(&self) -> BrokerHealth {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(self.config.retention_window_secs as i64);
        let commands = self.commands.read();
        let active_commands = commands
            .values()
            .filter(|c| c.status == CommandStatus::Running)
            .count();
        let expired_commands = commands
            .values()
            .filter(|c| c.is_terminal() && c.completed_at.is_some_and(|t| t <= cutoff))
            .count();
        drop(commands);

        let heartbeat_healthy = self
            .transport
            .last_heartbeat()
            .is_some_and(|t| {
                now.signed_duration_since(t).num_seconds()
                    <= 2 * self.config.heartbeat_interval_secs as i64
            });

        BrokerHealth {
            is_connected: self.transport.is_connected(),
            heartbeat_healthy,
            queue_size: self.queue_size(),
            active_commands,
            expired_commands,
            ssh_contexts: self.ssh.len(),
            queue_max_size: self.config.queue_max_size,
            retention_window_secs: self.config.retention_window_secs,
        }
    }

    // ── Cancellation ───────────────────────────────────────────────

    /// Cancel a command. Queued commands leave the queue immediately;
    /// running commands are aborted cooperatively by the dispatcher.
    /// Returns `Ok(false)` when the command is already terminal.
    pub fn cancel(&self, command_id: Uuid) -> Result<bool> {
        let queued_cancel = {
            let mut queue = self.queue.lock();
            let mut commands = self.commands.write();
            let Some(cmd) = commands.get_mut(&command_id) else {
                return Err(Error::not_found("command", command_id.to_string()));
            };
            match cmd.status {
                CommandStatus::Queued => {
                    queue.retain(|id| *id != command_id);
                    // Write-once transition cannot fail from Queued.
                    let _ = cmd.mark_terminal(CommandStatus::Cancelled, None, None);
                    Some(cmd.task_id)
                }
                CommandStatus::Running => None,
                _ => return Ok(false),
            }
        };

        match queued_cancel {
            Some(task_id) => {
                self.cancels.remove(command_id);
                self.publish_terminal(command_id, task_id, CommandStatus::Cancelled);
                tracing::info!(command_id = %command_id, "queued command cancelled");
            }
            None => {
                self.cancels.cancel(command_id);
                tracing::info!(command_id = %command_id, "running command cancel requested");
            }
        }
        Ok(true)
    }

    /// Cancel every non-terminal command of a task. Returns how many
    /// cancellations were initiated.
    pub fn cancel_for_task(&self, task_id: Uuid) -> usize {
        let ids: Vec<Uuid> = self
            .commands
            .read()
            .values()
            .filter(|c| c.task_id == task_id && !c.is_terminal())
            .map(|c| c.id)
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if matches!(self.cancel(id), Ok(true)) {
                cancelled += 1;
            }
        }
        cancelled
    }

    // ── SSH verification ───────────────────────────────────────────

    /// Probe a context's endpoint through the connector. Success stamps
    /// `last_verified`.
    pub async fn verify_ssh_context(&self, id: &str) -> Result<bool> {
        let ctx = self
            .ssh
            .get(id)
            .ok_or_else(|| Error::not_found("ssh_context", id.to_string()))?;
        let ok = self.transport.verify(ctx).await?;
        if ok {
            self.ssh.mark_verified(id);
        }
        Ok(ok)
    }

    // ── Retention / shutdown ───────────────────────────────────────

    /// Remove terminal commands older than the retention window.
    pub fn reap_expired(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.retention_window_secs as i64);
        let mut commands = self.commands.write();
        let before = commands.len();
        commands.retain(|_, c| {
            !c.is_terminal() || c.completed_at.map_or(true, |t| t > cutoff)
        });
        let reaped = before - commands.len();
        if reaped > 0 {
            tracing::info!(reaped, "reaped expired terminal commands");
        }
        reaped
    }

    /// Mark every still-queued command Cancelled (reason: shutdown).
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Uuid> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        let mut cancelled = 0;
        for command_id in drained {
            let task_id = {
                let mut commands = self.commands.write();
                commands.get_mut(&command_id).and_then(|cmd| {
                    cmd.mark_terminal(
                        CommandStatus::Cancelled,
                        None,
                        Some("shutdown".into()),
                    )
                    .ok()
                    .map(|_| cmd.task_id)
                })
            };
            if let Some(task_id) = task_id {
                self.cancels.remove(command_id);
                self.publish_terminal(command_id, task_id, CommandStatus::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "queued commands cancelled for shutdown");
        }
        cancelled
    }

    // ── Dispatcher ─────────────────────────────────────────────────

    /// Spawn the single dispatcher loop for this broker's connector.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            tracing::info!("command dispatcher started");
            loop {
                broker.wait_for_work().await;
                broker.wait_connected().await;
                let Some(command_id) = broker.pop_next() else {
                    continue;
                };
                broker.dispatch_one(command_id).await;
            }
        })
    }

    async fn wait_for_work(&self) {
        loop {
            let notified = self.queued_notify.notified();
            if !self.queue.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn wait_connected(&self) {
        let mut watch = self.transport.connection_watch();
        while !*watch.borrow_and_update() {
            if watch.changed().await.is_err() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// Pop the next command that is still Queued (cancelled entries were
    /// already removed, this is belt-and-braces against races).
    fn pop_next(&self) -> Option<Uuid> {
        let mut queue = self.queue.lock();
        let commands = self.commands.read();
        while let Some(id) = queue.pop_front() {
            if commands
                .get(&id)
                .is_some_and(|c| c.status == CommandStatus::Queued)
            {
                return Some(id);
            }
        }
        None
    }

    async fn dispatch_one(&self, command_id: Uuid) {
        let snapshot = {
            let mut commands = self.commands.write();
            let Some(cmd) = commands.get_mut(&command_id) else {
                return;
            };
            if cmd.mark_running().is_err() {
                // A cancel won the race while the command left the queue.
                return;
            }
            cmd.clone()
        };
        self.events.publish(HubEvent::CommandStatus {
            command_id,
            task_id: snapshot.task_id,
            status: CommandStatus::Running,
        });

        let token = self
            .cancels
            .get(command_id)
            .unwrap_or_else(CancellationToken::new);
        let timeout = Duration::from_secs(snapshot.timeout_seconds as u64);
        let mut attempt: u32 = 0;

        let terminal = loop {
            if token.is_cancelled() {
                break self.abort_with_grace(command_id).await;
            }

            let envelope = envelope_for(&snapshot);
            let outcome = tokio::select! {
                res = tokio::time::timeout(timeout, self.transport.deliver(envelope)) => {
                    match res {
                        Ok(Ok(reply)) if reply.success => Attempt::Success(reply.response),
                        Ok(Ok(reply)) => Attempt::Failure {
                            message: reply
                                .error
                                .unwrap_or_else(|| "connector reported failure".into()),
                            timed_out: false,
                        },
                        Ok(Err(e)) => Attempt::Failure {
                            message: e.to_string(),
                            timed_out: false,
                        },
                        Err(_) => Attempt::Failure {
                            message: format!("timed out after {}s", timeout.as_secs()),
                            timed_out: true,
                        },
                    }
                }
                _ = token.cancelled() => Attempt::Cancelled,
            };

            match outcome {
                Attempt::Success(response) => break Terminal::Completed(response),
                Attempt::Cancelled => break self.abort_with_grace(command_id).await,
                Attempt::Failure { message, timed_out } => {
                    if attempt >= snapshot.max_retries {
                        break if timed_out {
                            Terminal::Timeout(message)
                        } else {
                            Terminal::Failed(message)
                        };
                    }
                    attempt += 1;
                    {
                        let mut commands = self.commands.write();
                        if let Some(cmd) = commands.get_mut(&command_id) {
                            cmd.retry_count = attempt;
                        }
                    }
                    let wait = Duration::from_secs((1u64 << attempt).min(30));
                    tracing::warn!(
                        command_id = %command_id,
                        attempt,
                        max_retries = snapshot.max_retries,
                        wait_secs = wait.as_secs(),
                        error = %message,
                        "command delivery failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => break Terminal::Cancelled,
                    }
                }
            }
        };

        let (status, response, error) = match terminal {
            Terminal::Completed(response) => (CommandStatus::Completed, response, None),
            Terminal::Failed(message) => (CommandStatus::Failed, None, Some(message)),
            Terminal::Timeout(message) => (CommandStatus::Timeout, None, Some(message)),
            Terminal::Cancelled => (CommandStatus::Cancelled, None, None),
        };

        let finalized = {
            let mut commands = self.commands.write();
            commands
                .get_mut(&command_id)
                .map(|cmd| (cmd.mark_terminal(status, response, error).is_ok(), cmd.task_id))
        };
        if let Some((wrote, task_id)) = finalized {
            if wrote {
                self.publish_terminal(command_id, task_id, status);
            }
        }
        self.cancels.remove(command_id);
    }

    /// Ask the connector to abort, bounded by the grace window, then force
    /// the Cancelled state regardless of the ack.
    async fn abort_with_grace(&self, command_id: Uuid) -> Terminal {
        let grace = Duration::from_secs(self.config.abort_grace_secs);
        let acked = tokio::time::timeout(grace, self.transport.abort(command_id))
            .await
            .unwrap_or(false);
        tracing::info!(command_id = %command_id, acked, "running command aborted");
        Terminal::Cancelled
    }

    fn publish_terminal(&self, command_id: Uuid, task_id: Uuid, status: CommandStatus) {
        self.events.publish(HubEvent::CommandStatus {
            command_id,
            task_id,
            status,
        });
        self.events.publish(HubEvent::CommandTerminal {
            command_id,
            task_id,
            status,
        });
    }
}

fn envelope_for(command: &Command) -> CommandEnvelope {
    CommandEnvelope {
        command_id: command.id,
        task_id: command.task_id,
        kind: command.kind,
        content: command.content.clone(),
        metadata: command.metadata.clone(),
        ssh: command.ssh_context.clone(),
        timeout_seconds: command.timeout_seconds,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tokio::sync::watch;

    use hub_domain::command::SshContext;
    use hub_domain::error::Result;

    use crate::connector::CommandReply;

    // ── Scripted transport ──────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct ScriptedTransport {
        connected_tx: watch::Sender<bool>,
        behavior: Mutex<Behavior>,
        delivered: Mutex<Vec<CommandEnvelope>>,
        aborted: Mutex<Vec<Uuid>>,
        heartbeat: RwLock<Option<DateTime<Utc>>>,
    }

    impl ScriptedTransport {
        fn new(connected: bool) -> Arc<Self> {
            let (connected_tx, _rx) = watch::channel(connected);
            Arc::new(Self {
                connected_tx,
                behavior: Mutex::new(Behavior::Succeed),
                delivered: Mutex::new(Vec::new()),
                aborted: Mutex::new(Vec::new()),
                heartbeat: RwLock::new(None),
            })
        }

        fn set_connected(&self, connected: bool) {
            let _ = self.connected_tx.send(connected);
        }

        fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock() = behavior;
        }

        fn delivered_hosts(&self) -> Vec<Option<String>> {
            self.delivered
                .lock()
                .iter()
                .map(|e| e.ssh.as_ref().map(|s| s.host.clone()))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl ConnectorTransport for ScriptedTransport {
        fn is_connected(&self) -> bool {
            *self.connected_tx.borrow()
        }

        fn connection_watch(&self) -> watch::Receiver<bool> {
            self.connected_tx.subscribe()
        }

        fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
            *self.heartbeat.read()
        }

        async fn deliver(&self, envelope: CommandEnvelope) -> Result<CommandReply> {
            self.delivered.lock().push(envelope);
            let behavior = *self.behavior.lock();
            match behavior {
                Behavior::Succeed => Ok(CommandReply {
                    success: true,
                    response: Some("done".into()),
                    error: None,
                }),
                Behavior::Fail => Ok(CommandReply {
                    success: false,
                    response: None,
                    error: Some("automation failed".into()),
                }),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn abort(&self, command_id: Uuid) -> bool {
            self.aborted.lock().push(command_id);
            true
        }

        async fn verify(&self, _ssh: SshContext) -> Result<bool> {
            Ok(self.is_connected())
        }
    }

    // ── Harness ─────────────────────────────────────────────────────

    fn broker_with(
        transport: Arc<ScriptedTransport>,
        tweak: impl FnOnce(&mut ConnectorConfig),
    ) -> Arc<CommandBroker> {
        let mut config = ConnectorConfig::default();
        config.abort_grace_secs = 1;
        tweak(&mut config);
        let ssh = Arc::new(SshContextRegistry::new(config.ssh_enabled));
        Arc::new(CommandBroker::new(
            config,
            transport,
            ssh,
            Arc::new(EventBus::new(256)),
        ))
    }

    fn new_command(content: &str) -> NewCommand {
        NewCommand {
            task_id: Uuid::new_v4(),
            kind: CommandKind::Prompt,
            content: content.into(),
            metadata: None,
            ssh_context_id: None,
            timeout_seconds: None,
        }
    }

    async fn wait_terminal(broker: &CommandBroker, id: Uuid) -> Command {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Some(cmd) = broker.status(id) {
                    if cmd.is_terminal() {
                        return cmd;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("command did not reach a terminal state")
    }

    // ── Enqueue validation ──────────────────────────────────────────

    #[tokio::test]
    async fn enqueue_validates_content_and_metadata() {
        let broker = broker_with(ScriptedTransport::new(false), |_| {});

        assert!(broker.enqueue(new_command("")).is_err());
        assert!(broker.enqueue(new_command(&"x".repeat(10_001))).is_err());

        let mut cmd = new_command("ok");
        cmd.metadata = Some(serde_json::json!({"blob": "x".repeat(5_000)}));
        assert!(broker.enqueue(cmd).is_err());

        let mut cmd = new_command("ok");
        cmd.timeout_seconds = Some(0);
        assert!(broker.enqueue(cmd).is_err());
        let mut cmd = new_command("ok");
        cmd.timeout_seconds = Some(3_601);
        assert!(broker.enqueue(cmd).is_err());
        let mut cmd = new_command("ok");
        cmd.timeout_seconds = Some(3_600);
        assert!(broker.enqueue(cmd).is_ok());
    }

    #[tokio::test]
    async fn queue_full_rejects_until_a_slot_frees() {
        let broker = broker_with(ScriptedTransport::new(false), |c| c.queue_max_size = 2);

        let first = broker.enqueue(new_command("one")).unwrap();
        broker.enqueue(new_command("two")).unwrap();

        let err = broker.enqueue(new_command("three")).unwrap_err();
        assert!(matches!(err, Error::BusinessLogic(_)));

        // Dropping one admits the next.
        broker.cancel(first.command_id).unwrap();
        assert!(broker.enqueue(new_command("three")).is_ok());
    }

    #[tokio::test]
    async fn enqueue_unknown_ssh_context_is_not_found() {
        let broker = broker_with(ScriptedTransport::new(false), |_| {});
        let mut cmd = new_command("ok");
        cmd.ssh_context_id = Some("ghost".into());
        assert!(matches!(
            broker.enqueue(cmd),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_with_ssh_disabled_is_business_logic() {
        let broker = broker_with(ScriptedTransport::new(false), |c| c.ssh_enabled = false);
        let mut cmd = new_command("ok");
        cmd.ssh_context_id = Some("dev".into());
        assert!(matches!(
            broker.enqueue(cmd),
            Err(Error::BusinessLogic(_))
        ));
    }

    // ── Dispatch ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn fifo_delivery_and_cancel_while_queued() {
        let transport = ScriptedTransport::new(false);
        let broker = broker_with(transport.clone(), |_| {});
        let dispatcher = broker.spawn_dispatcher();

        let c1 = broker.enqueue(new_command("first")).unwrap();
        let c2 = broker.enqueue(new_command("second")).unwrap();
        let c3 = broker.enqueue(new_command("third")).unwrap();
        assert_eq!(broker.queue_size(), 3);

        // Cancel the middle command while the link is down.
        assert!(broker.cancel(c2.command_id).unwrap());
        let cancelled = broker.status(c2.command_id).unwrap();
        assert_eq!(cancelled.status, CommandStatus::Cancelled);

        transport.set_connected(true);

        let done1 = wait_terminal(&broker, c1.command_id).await;
        let done3 = wait_terminal(&broker, c3.command_id).await;
        assert_eq!(done1.status, CommandStatus::Completed);
        assert_eq!(done3.status, CommandStatus::Completed);
        assert_eq!(done1.response.as_deref(), Some("done"));

        // C2 was never transmitted, and order was C1 then C3.
        let contents: Vec<String> = transport
            .delivered
            .lock()
            .iter()
            .map(|e| e.content.clone())
            .collect();
        assert_eq!(contents, vec!["first", "third"]);

        dispatcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ssh_snapshot_survives_context_edit() {
        let transport = ScriptedTransport::new(false);
        let broker = broker_with(transport.clone(), |_| {});
        broker
            .ssh_registry()
            .upsert(SshContext::new("dev", "h1"))
            .unwrap();
        let dispatcher = broker.spawn_dispatcher();

        let mut cmd = new_command("remote op");
        cmd.ssh_context_id = Some("dev".into());
        let receipt = broker.enqueue(cmd).unwrap();
        assert!(receipt.ssh_context_used);

        // Edit the context while the command sits in the queue.
        broker
            .ssh_registry()
            .upsert(SshContext::new("dev", "h2"))
            .unwrap();

        transport.set_connected(true);
        let done = wait_terminal(&broker, receipt.command_id).await;
        assert_eq!(done.status, CommandStatus::Completed);

        // The connector saw the snapshot taken at enqueue time.
        assert_eq!(transport.delivered_hosts(), vec![Some("h1".to_string())]);
        assert_eq!(done.ssh_context.unwrap().host, "h1");

        dispatcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_then_goes_terminal() {
        let transport = ScriptedTransport::new(true);
        transport.set_behavior(Behavior::Fail);
        let broker = broker_with(transport.clone(), |c| c.max_retries = 1);
        let dispatcher = broker.spawn_dispatcher();

        let receipt = broker.enqueue(new_command("doomed")).unwrap();
        let done = wait_terminal(&broker, receipt.command_id).await;

        assert_eq!(done.status, CommandStatus::Failed);
        assert_eq!(done.retry_count, 1);
        assert_eq!(done.error.as_deref(), Some("automation failed"));
        assert_eq!(transport.delivered.lock().len(), 2);

        dispatcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_delivery_times_out() {
        let transport = ScriptedTransport::new(true);
        transport.set_behavior(Behavior::Hang);
        let broker = broker_with(transport.clone(), |c| c.max_retries = 0);
        let dispatcher = broker.spawn_dispatcher();

        let mut cmd = new_command("slow");
        cmd.timeout_seconds = Some(1);
        let receipt = broker.enqueue(cmd).unwrap();

        let done = wait_terminal(&broker, receipt.command_id).await;
        assert_eq!(done.status, CommandStatus::Timeout);
        assert!(done.error.unwrap().contains("timed out"));

        dispatcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_aborts_with_grace() {
        let transport = ScriptedTransport::new(true);
        transport.set_behavior(Behavior::Hang);
        let broker = broker_with(transport.clone(), |_| {});
        let dispatcher = broker.spawn_dispatcher();

        let receipt = broker.enqueue(new_command("long running")).unwrap();

        // Let the dispatcher pick it up.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if broker.status(receipt.command_id).unwrap().status == CommandStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(broker.cancel(receipt.command_id).unwrap());
        let done = wait_terminal(&broker, receipt.command_id).await;
        assert_eq!(done.status, CommandStatus::Cancelled);
        assert_eq!(
            transport.aborted.lock().as_slice(),
            &[receipt.command_id]
        );

        // A second cancel reports "already terminal".
        assert!(!broker.cancel(receipt.command_id).unwrap());

        dispatcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_state_is_write_once() {
        let transport = ScriptedTransport::new(true);
        let broker = broker_with(transport.clone(), |_| {});
        let dispatcher = broker.spawn_dispatcher();

        let receipt = broker.enqueue(new_command("quick")).unwrap();
        let done = wait_terminal(&broker, receipt.command_id).await;
        assert_eq!(done.status, CommandStatus::Completed);

        assert!(!broker.cancel(receipt.command_id).unwrap());
        assert_eq!(
            broker.status(receipt.command_id).unwrap().status,
            CommandStatus::Completed
        );

        dispatcher.abort();
    }

    #[tokio::test]
    async fn cancel_for_task_sweeps_all_pending() {
        let broker = broker_with(ScriptedTransport::new(false), |_| {});
        let task_id = Uuid::new_v4();

        for i in 0..3 {
            let mut cmd = new_command(&format!("cmd {i}"));
            cmd.task_id = task_id;
            broker.enqueue(cmd).unwrap();
        }
        let mut other = new_command("other");
        other.task_id = Uuid::new_v4();
        let other_receipt = broker.enqueue(other).unwrap();

        assert_eq!(broker.cancel_for_task(task_id), 3);
        assert_eq!(broker.queue_size(), 1);
        assert_eq!(
            broker.status(other_receipt.command_id).unwrap().status,
            CommandStatus::Queued
        );
    }

    #[tokio::test]
    async fn reap_and_expired_accounting() {
        let transport = ScriptedTransport::new(false);
        let broker = broker_with(transport, |c| c.retention_window_secs = 600);

        let receipt = broker.enqueue(new_command("old")).unwrap();
        broker.cancel(receipt.command_id).unwrap();

        // Fresh terminal command: retained, not expired.
        assert_eq!(broker.health().expired_commands, 0);
        assert_eq!(broker.reap_expired(), 0);

        // Age it past the window.
        {
            let mut commands = broker.commands.write();
            let cmd = commands.get_mut(&receipt.command_id).unwrap();
            cmd.completed_at = Some(Utc::now() - chrono::Duration::seconds(700));
        }
        assert_eq!(broker.health().expired_commands, 1);
        assert_eq!(broker.reap_expired(), 1);
        assert!(broker.status(receipt.command_id).is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_with_reason() {
        let broker = broker_with(ScriptedTransport::new(false), |_| {});
        let a = broker.enqueue(new_command("a")).unwrap();
        let b = broker.enqueue(new_command("b")).unwrap();

        assert_eq!(broker.shutdown(), 2);
        for id in [a.command_id, b.command_id] {
            let cmd = broker.status(id).unwrap();
            assert_eq!(cmd.status, CommandStatus::Cancelled);
            assert_eq!(cmd.error.as_deref(), Some("shutdown"));
        }
        assert_eq!(broker.queue_size(), 0);
    }

    #[tokio::test]
    async fn verify_updates_last_verified() {
        let transport = ScriptedTransport::new(true);
        let broker = broker_with(transport, |_| {});
        broker
            .ssh_registry()
            .upsert(SshContext::new("dev", "h1"))
            .unwrap();

        assert!(broker.verify_ssh_context("dev").await.unwrap());
        assert!(broker
            .ssh_registry()
            .get("dev")
            .unwrap()
            .last_verified
            .is_some());

        assert!(matches!(
            broker.verify_ssh_context("ghost").await,
            Err(Error::NotFound { .. })
        ));
    }
}
