//! Connector commands and SSH contexts.
//!
//! A command is one instruction bound for the Cursor Connector. The broker
//! owns the lifecycle; the write-once terminal rule is enforced here so no
//! caller can resurrect a finished command.

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
pub enum CommandKind {
    Prompt,
    FileOp,
    ShellOp,
    Navigate,
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation bounds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const COMMAND_CONTENT_MAX_LEN: usize = 10_000;
pub const COMMAND_METADATA_MAX_BYTES: usize = 5_000;
pub const COMMAND_TIMEOUT_MIN_SECS: u32 = 1;
pub const COMMAND_TIMEOUT_MAX_SECS: u32 = 3_600;
pub const COMMAND_TIMEOUT_DEFAULT_SECS: u32 = 300;
pub const SSH_CONTEXT_ID_MAX_LEN: usize = 100;

/// Validate command content: non-blank after trimming, bounded length.
pub fn validate_command_content(content: &str) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("command content cannot be empty"));
    }
    if trimmed.len() > COMMAND_CONTENT_MAX_LEN {
        return Err(Error::validation(format!(
            "command content cannot exceed {COMMAND_CONTENT_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate the serialized size of a metadata bag.
pub fn validate_command_metadata(metadata: &serde_json::Value) -> Result<()> {
    let serialized = serde_json::to_string(metadata)
        .map_err(|e| Error::validation(format!("metadata is not serializable: {e}")))?;
    if serialized.len() > COMMAND_METADATA_MAX_BYTES {
        return Err(Error::validation(format!(
            "metadata exceeds {COMMAND_METADATA_MAX_BYTES} bytes serialized"
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSH context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named remote endpoint a command may attach to. Commands snapshot the
/// context by value at enqueue time, so later edits never affect them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshContext {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
}

impl SshContext {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: 22,
            username: None,
            key_path: None,
            working_directory: None,
            environment: HashMap::new(),
            is_active: true,
            last_verified: None,
        }
    }

    /// Validate id charset/length, host, and port bounds.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("SSH context id cannot be empty"));
        }
        if self.id.len() > SSH_CONTEXT_ID_MAX_LEN {
            return Err(Error::validation(format!(
                "SSH context id cannot exceed {SSH_CONTEXT_ID_MAX_LEN} characters"
            )));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::validation(
                "SSH context id may only contain alphanumerics, hyphens, and underscores",
            ));
        }
        if self.host.trim().is_empty() {
            return Err(Error::validation("SSH host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::validation("SSH port must be in 1..=65535"));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: CommandKind,
    pub content: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Snapshot of the referenced SSH context taken at enqueue time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_context: Option<SshContext>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Command {
    pub fn new(task_id: Uuid, kind: CommandKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind,
            content: content.into(),
            status: CommandStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: COMMAND_TIMEOUT_DEFAULT_SECS,
            response: None,
            error: None,
            ssh_context: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued → Running. Stamps started_at on the first attempt only.
    pub fn mark_running(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::invalid_transition(format!(
                "command {} is already terminal ({:?})",
                self.id, self.status
            )));
        }
        self.status = CommandStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Write-once terminal transition. Returns an error if the command is
    /// already terminal (a late completion never overwrites a cancel).
    pub fn mark_terminal(
        &mut self,
        status: CommandStatus,
        response: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::invalid_transition(format!(
                "{status:?} is not a terminal command status"
            )));
        }
        if self.is_terminal() {
            return Err(Error::invalid_transition(format!(
                "command {} is already terminal ({:?})",
                self.id, self.status
            )));
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        if response.is_some() {
            self.response = response;
        }
        if error.is_some() {
            self.error = error;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_status_terminal() {
        assert!(!CommandStatus::Queued.is_terminal());
        assert!(!CommandStatus::Running.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
        assert!(CommandStatus::Timeout.is_terminal());
    }

    #[test]
    fn kind_snake_case_serialization() {
        assert_eq!(
            serde_json::to_string(&CommandKind::ShellOp).unwrap(),
            "\"shell_op\""
        );
        assert_eq!(
            serde_json::to_string(&CommandKind::Prompt).unwrap(),
            "\"prompt\""
        );
    }

    #[test]
    fn content_validation_bounds() {
        assert!(validate_command_content("").is_err());
        assert!(validate_command_content("   ").is_err());
        assert_eq!(validate_command_content(" x ").unwrap(), "x");
        assert!(validate_command_content(&"a".repeat(10_000)).is_ok());
        assert!(validate_command_content(&"a".repeat(10_001)).is_err());
    }

    #[test]
    fn metadata_size_bound() {
        let small = serde_json::json!({"k": "v"});
        assert!(validate_command_metadata(&small).is_ok());

        let big = serde_json::json!({"blob": "x".repeat(5_000)});
        assert!(validate_command_metadata(&big).is_err());
    }

    #[test]
    fn ssh_context_validation() {
        let ctx = SshContext::new("dev-server_1", "192.168.1.100");
        assert!(ctx.validate().is_ok());

        let mut bad = SshContext::new("bad id!", "h");
        assert!(bad.validate().is_err());

        bad = SshContext::new("", "h");
        assert!(bad.validate().is_err());

        bad = SshContext::new("a".repeat(101), "h");
        assert!(bad.validate().is_err());

        bad = SshContext::new("ok", "  ");
        assert!(bad.validate().is_err());

        bad = SshContext::new("ok", "h");
        bad.port = 0;
        assert!(bad.validate().is_err());
        bad.port = 65_535;
        assert!(bad.validate().is_ok());
    }

    #[test]
    fn running_stamps_started_at_once() {
        let mut cmd = Command::new(Uuid::new_v4(), CommandKind::Prompt, "do it");
        cmd.mark_running().unwrap();
        let first = cmd.started_at.unwrap();
        // Retry path goes back through Running without re-stamping.
        cmd.status = CommandStatus::Queued;
        cmd.mark_running().unwrap();
        assert_eq!(cmd.started_at.unwrap(), first);
    }

    #[test]
    fn terminal_is_write_once() {
        let mut cmd = Command::new(Uuid::new_v4(), CommandKind::Prompt, "x");
        cmd.mark_terminal(CommandStatus::Cancelled, None, None)
            .unwrap();
        // A late completion cannot overwrite the cancel.
        assert!(cmd
            .mark_terminal(CommandStatus::Completed, Some("ok".into()), None)
            .is_err());
        assert_eq!(cmd.status, CommandStatus::Cancelled);
        assert!(cmd.response.is_none());
    }

    #[test]
    fn terminal_requires_terminal_status() {
        let mut cmd = Command::new(Uuid::new_v4(), CommandKind::Prompt, "x");
        assert!(cmd.mark_terminal(CommandStatus::Running, None, None).is_err());
    }

    #[test]
    fn mark_running_after_terminal_rejected() {
        let mut cmd = Command::new(Uuid::new_v4(), CommandKind::Prompt, "x");
        cmd.mark_terminal(CommandStatus::Completed, Some("done".into()), None)
            .unwrap();
        assert!(cmd.mark_running().is_err());
    }
}
