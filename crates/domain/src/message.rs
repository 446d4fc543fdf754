//! Messages exchanged within a task.
//!
//! Messages are the durable conversation record (append-only, soft-deleted
//! with their task). The orchestrator's in-memory conversation context is a
//! separate structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    User,
    Cursor,
    Gemini,
    System,
}

pub const MESSAGE_CONTENT_MAX_LEN: usize = 32_000;
pub const RELATED_FILE_NAME_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub task_id: Uuid,
    pub sender: MessageSender,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_file_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Message {
    pub fn new(task_id: Uuid, sender: MessageSender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            sender,
            content: content.into(),
            related_file_name: None,
            created_at: Utc::now(),
            created_by: None,
        }
    }
}
