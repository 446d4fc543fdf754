//! In-memory reference implementation of [`TaskStore`].
//!
//! Backs the `memory://` db URL. Single-process only; rows live in
//! `parking_lot` maps and every mutation stamps `updated_at`.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use hub_domain::error::{Error, Result};
use hub_domain::message::Message;
use hub_domain::task::Task;

use crate::{TaskFilter, TaskPage, TaskPatch, TaskStore};

pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    /// task_id → messages in append order.
    messages: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, mut task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write();
        let collision = tasks
            .values()
            .any(|t| !t.is_deleted && t.title == task.title);
        if collision {
            return Err(Error::Duplicate(format!(
                "a task titled {:?} already exists",
                task.title
            )));
        }
        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .read()
            .get(&id)
            .filter(|t| !t.is_deleted)
            .cloned()
            .ok_or_else(|| Error::not_found("task", id.to_string()))
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        skip: usize,
        limit: usize,
    ) -> Result<TaskPage> {
        let tasks = self.tasks.read();

        let mut matching: Vec<&Task> = tasks
            .values()
            .filter(|t| !t.is_deleted && filter.matches(t))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let page: Vec<Task> = matching
            .into_iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect();

        Ok(TaskPage {
            has_next: skip + page.len() < total,
            has_prev: skip > 0,
            tasks: page,
            total,
            skip,
            limit,
        })
    }

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&id)
            .filter(|t| !t.is_deleted)
            .ok_or_else(|| Error::not_found("task", id.to_string()))?;
        patch.apply(task);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if !tasks.contains_key(&task.id) {
            return Err(Error::not_found("task", task.id.to_string()));
        }
        let mut record = task.clone();
        record.updated_at = Utc::now();
        tasks.insert(record.id, record);
        Ok(())
    }

    async fn soft_delete_task(&self, id: Uuid, actor: Option<&str>) -> Result<bool> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("task", id.to_string()))?;
        if task.is_deleted {
            return Ok(false);
        }
        task.is_deleted = true;
        task.deleted_at = Some(Utc::now());
        task.updated_at = Utc::now();
        tracing::debug!(task_id = %id, actor = actor.unwrap_or("-"), "task soft-deleted");
        Ok(true)
    }

    async fn append_message(&self, message: Message) -> Result<Message> {
        {
            let tasks = self.tasks.read();
            let live = tasks
                .get(&message.task_id)
                .map(|t| !t.is_deleted)
                .unwrap_or(false);
            if !live {
                return Err(Error::not_found("task", message.task_id.to_string()));
            }
        }
        self.messages
            .write()
            .entry(message.task_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<Message>> {
        {
            let tasks = self.tasks.read();
            let live = tasks
                .get(&task_id)
                .map(|t| !t.is_deleted)
                .unwrap_or(false);
            if !live {
                return Err(Error::not_found("task", task_id.to_string()));
            }
        }
        Ok(self
            .messages
            .read()
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn task_count(&self) -> Result<usize> {
        Ok(self.tasks.read().values().filter(|t| !t.is_deleted).count())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
