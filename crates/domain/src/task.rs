//! Task records and the task/turn state machine.
//!
//! A task is a persistent multi-agent work unit. The pure transition rules
//! live here on [`Task`]; the gateway's state engine loads a record,
//! applies a transition, and persists the result — nothing else mutates
//! task fields.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    ProcessingCursor,
    AwaitingUserGemini,
    ProcessingGemini,
    AwaitingUserCursor,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Which participant is expected to act next on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTurn {
    User,
    Cursor,
    Gemini,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation bounds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const TITLE_MAX_LEN: usize = 255;
pub const DESCRIPTION_MAX_LEN: usize = 2000;
pub const PROJECT_PATH_MAX_LEN: usize = 500;
pub const SSH_HOST_MAX_LEN: usize = 255;
pub const SSH_USER_MAX_LEN: usize = 100;
pub const ESTIMATED_DURATION_MAX_SECS: u32 = 86_400;
pub const MAX_RETRIES_CAP: u32 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub current_turn: TaskTurn,
    pub priority: TaskPriority,
    /// 0..=100, clamped on write.
    pub progress: u8,
    /// Per-agent opaque context bags, keyed by agent name ("cursor", "gemini").
    #[serde(default)]
    pub ai_contexts: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Estimated duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u32>,
    /// Wall-clock seconds from started_at to the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            current_turn: TaskTurn::User,
            priority: TaskPriority::Normal,
            progress: 0,
            ai_contexts: HashMap::new(),
            project_path: None,
            ssh_host: None,
            ssh_user: None,
            started_at: None,
            completed_at: None,
            estimated_duration: None,
            actual_duration: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
            created_by: None,
            is_deleted: false,
            deleted_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A task is remote when both SSH endpoint fields are present.
    pub fn is_remote_ssh(&self) -> bool {
        self.ssh_host.is_some() && self.ssh_user.is_some()
    }

    // ── State machine ──────────────────────────────────────────────

    /// Pending → ProcessingCursor. Stamps started_at and seeds progress.
    pub fn start(&mut self) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(Error::invalid_transition(format!(
                "cannot start task in status {:?}",
                self.status
            )));
        }
        self.status = TaskStatus::ProcessingCursor;
        self.started_at = Some(Utc::now());
        self.set_progress(5);
        Ok(())
    }

    /// Any non-terminal → Completed. Forces progress to 100.
    pub fn complete(&mut self) -> Result<()> {
        self.ensure_non_terminal("complete")?;
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.finish_timing();
        Ok(())
    }

    /// Any non-terminal → Failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_non_terminal("fail")?;
        self.status = TaskStatus::Failed;
        self.error_message = Some(reason.into());
        self.finish_timing();
        Ok(())
    }

    /// Any non-terminal → Cancelled.
    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_non_terminal("cancel")?;
        self.status = TaskStatus::Cancelled;
        self.finish_timing();
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Failed → Pending, consuming one retry. Progress is clamped back to
    /// at most 10 so a retried task still shows prior movement.
    pub fn retry(&mut self) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(Error::invalid_transition(format!(
                "cannot retry task in status {:?}",
                self.status
            )));
        }
        if self.retry_count >= self.max_retries {
            return Err(Error::BusinessLogic(format!(
                "retry budget exhausted ({}/{})",
                self.retry_count, self.max_retries
            )));
        }
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.current_turn = TaskTurn::User;
        self.error_message = None;
        self.completed_at = None;
        self.actual_duration = None;
        self.progress = self.progress.min(10);
        Ok(())
    }

    /// Hand the turn to another participant. Self-loops are rejected;
    /// status is recomputed from the destination turn.
    pub fn advance_turn(&mut self, next: TaskTurn) -> Result<()> {
        self.ensure_non_terminal("advance turn on")?;
        if next == self.current_turn {
            return Err(Error::invalid_transition(format!(
                "turn is already {:?}",
                next
            )));
        }
        let previous = self.current_turn;
        self.current_turn = next;
        match next {
            TaskTurn::Cursor => self.status = TaskStatus::ProcessingCursor,
            TaskTurn::Gemini => self.status = TaskStatus::ProcessingGemini,
            TaskTurn::User => {
                self.status = if previous == TaskTurn::Cursor {
                    TaskStatus::AwaitingUserCursor
                } else {
                    TaskStatus::AwaitingUserGemini
                };
            }
            TaskTurn::System => {}
        }
        Ok(())
    }

    /// Clamp into 0..=100, monotone non-decreasing within a run.
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    // ── Per-agent context bags ─────────────────────────────────────

    pub fn ai_context(&self, agent: &str) -> serde_json::Value {
        self.ai_contexts
            .get(agent)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Last-write-wins replacement of one agent's bag.
    pub fn update_ai_context(&mut self, agent: impl Into<String>, bag: serde_json::Value) {
        self.ai_contexts.insert(agent.into(), bag);
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn ensure_non_terminal(&self, action: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::invalid_transition(format!(
                "cannot {action} task in terminal status {:?}",
                self.status
            )));
        }
        Ok(())
    }

    fn finish_timing(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            let secs = now.signed_duration_since(started).num_seconds().max(0);
            self.actual_duration = Some(secs as u32);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
