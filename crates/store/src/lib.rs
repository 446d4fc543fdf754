//! Durable record of tasks and messages.
//!
//! The [`TaskStore`] trait is the only persistence seam the gateway knows
//! about. Each method is one implicit transaction. The state engine is the
//! sole writer of task fields and always goes through this trait.

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hub_domain::error::Result;
use hub_domain::message::Message;
use hub_domain::task::{Task, TaskPriority, TaskStatus, TaskTurn};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filter / page / patch shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filters for task listing. All fields combine with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    /// Case-insensitive substring match over title and description.
    pub search: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub current_turn: Option<TaskTurn>,
    pub created_by: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub is_remote_ssh: Option<bool>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref term) = self.search {
            let term = term.to_lowercase();
            let in_title = task.title.to_lowercase().contains(&term);
            let in_description = task
                .description
                .as_ref()
                .is_some_and(|d| d.to_lowercase().contains(&term));
            if !in_title && !in_description {
                return false;
            }
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(turn) = self.current_turn {
            if task.current_turn != turn {
                return false;
            }
        }
        if let Some(ref creator) = self.created_by {
            if task.created_by.as_deref() != Some(creator.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at > before {
                return false;
            }
        }
        if let Some(remote) = self.is_remote_ssh {
            if task.is_remote_ssh() != remote {
                return false;
            }
        }
        true
    }
}

/// One page of a task listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: usize,
    pub skip: usize,
    pub limit: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

/// A partial update of editable task fields. Lifecycle fields (status,
/// retries, timings) are owned by the state engine and are not patchable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    /// Explicit progress writes may lower progress (unlike engine bumps).
    pub progress: Option<u8>,
    pub project_path: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub estimated_duration: Option<u32>,
    pub ai_contexts: Option<std::collections::HashMap<String, serde_json::Value>>,
}

impl TaskPatch {
    /// Apply to a task record. The store stamps `updated_at`.
    pub fn apply(&self, task: &mut Task) {
        if let Some(ref title) = self.title {
            task.title = title.clone();
        }
        if let Some(ref description) = self.description {
            task.description = Some(description.clone());
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(ref path) = self.project_path {
            task.project_path = Some(path.clone());
        }
        if let Some(ref host) = self.ssh_host {
            task.ssh_host = Some(host.clone());
        }
        if let Some(ref user) = self.ssh_user {
            task.ssh_user = Some(user.clone());
        }
        if let Some(duration) = self.estimated_duration {
            task.estimated_duration = Some(duration);
        }
        if let Some(ref contexts) = self.ai_contexts {
            task.ai_contexts = contexts.clone();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence seam for tasks and their messages.
///
/// Soft-deleted rows are excluded from reads. Errors map onto the shared
/// taxonomy: `NotFound`, `Duplicate` (title collision on create), and
/// `Database` for backend failures.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `Duplicate` when a live task already
    /// carries the same title.
    async fn create_task(&self, task: Task) -> Result<Task>;

    /// Fetch a task by id. Soft-deleted tasks are not found.
    async fn get_task(&self, id: Uuid) -> Result<Task>;

    /// List tasks matching `filter`, newest-first, paginated.
    async fn list_tasks(&self, filter: &TaskFilter, skip: usize, limit: usize)
        -> Result<TaskPage>;

    /// Apply a field patch. Returns the updated record.
    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<Task>;

    /// Persist a full task record mutated by the state engine.
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Soft-delete. Idempotent: deleting an already-deleted task returns
    /// `false` without touching `deleted_at`.
    async fn soft_delete_task(&self, id: Uuid, actor: Option<&str>) -> Result<bool>;

    /// Append one message under its task.
    async fn append_message(&self, message: Message) -> Result<Message>;

    /// All messages of a task in append order.
    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<Message>>;

    /// Number of live (non-deleted) tasks. Used by health reporting.
    async fn task_count(&self) -> Result<usize>;
}
