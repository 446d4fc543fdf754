//! In-process event bus.
//!
//! Producers publish typed [`HubEvent`]s without blocking; each subscriber
//! drains its own bounded view of the stream. A slow subscriber loses the
//! oldest events it has not yet read and its dropped counter records how
//! many. Publish order is global, so per-task and per-command event order
//! is preserved for every subscriber that observes them.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use hub_domain::command::CommandStatus;
use hub_domain::message::MessageSender;
use hub_domain::task::TaskStatus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    TaskCreated {
        task_id: Uuid,
    },
    TaskUpdated {
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
    },
    TaskTerminated {
        task_id: Uuid,
        status: TaskStatus,
    },
    MessageAppended {
        task_id: Uuid,
        message_id: Uuid,
        sender: MessageSender,
    },
    ConversationStreamStart {
        task_id: Uuid,
    },
    ConversationStreamChunk {
        task_id: Uuid,
        content: String,
    },
    ConversationStreamEnd {
        task_id: Uuid,
        full_length: usize,
    },
    ConversationComplete {
        task_id: Uuid,
        response_length: usize,
    },
    CommandQueued {
        command_id: Uuid,
        task_id: Uuid,
        queue_position: usize,
    },
    CommandStatus {
        command_id: Uuid,
        task_id: Uuid,
        status: CommandStatus,
    },
    CommandTerminal {
        command_id: Uuid,
        task_id: Uuid,
        status: CommandStatus,
    },
    HeartbeatHealth {
        healthy: bool,
    },
}

impl HubEvent {
    /// The task this event belongs to, when it is task-scoped.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskCreated { task_id }
            | Self::TaskUpdated { task_id, .. }
            | Self::TaskTerminated { task_id, .. }
            | Self::MessageAppended { task_id, .. }
            | Self::ConversationStreamStart { task_id }
            | Self::ConversationStreamChunk { task_id, .. }
            | Self::ConversationStreamEnd { task_id, .. }
            | Self::ConversationComplete { task_id, .. }
            | Self::CommandQueued { task_id, .. }
            | Self::CommandStatus { task_id, .. }
            | Self::CommandTerminal { task_id, .. } => Some(*task_id),
            Self::HeartbeatHealth { .. } => None,
        }
    }

    /// The command this event belongs to, when it is command-scoped.
    pub fn command_id(&self) -> Option<Uuid> {
        match self {
            Self::CommandQueued { command_id, .. }
            | Self::CommandStatus { command_id, .. }
            | Self::CommandTerminal { command_id, .. } => Some(*command_id),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl EventBus {
    /// `buffer` is the per-subscriber backlog before drop-oldest kicks in.
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Non-blocking publish. Events published with no subscribers are
    /// silently discarded.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One subscriber's view of the bus. Single-consumer; `next` returns
/// `None` once the bus is gone.
pub struct EventSubscriber {
    rx: broadcast::Receiver<HubEvent>,
    dropped: u64,
}

impl EventSubscriber {
    pub async fn next(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::warn!(missed = n, "slow event subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking drain of whatever is immediately available.
    pub fn try_next(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber lost to backlog overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
