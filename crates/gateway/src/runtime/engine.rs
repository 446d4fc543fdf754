//! Task state engine.
//!
//! Sole mutator of task fields. Every operation loads the record through
//! the store, applies the pure transition on [`Task`], persists the result
//! in the same call, and only then publishes to the event bus — a store
//! failure aborts the operation before any event leaves the process.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use hub_domain::error::{Error, Result};
use hub_domain::message::{
    Message, MessageSender, MESSAGE_CONTENT_MAX_LEN, RELATED_FILE_NAME_MAX_LEN,
};
use hub_domain::task::{
    Task, TaskPriority, TaskTurn, DESCRIPTION_MAX_LEN, ESTIMATED_DURATION_MAX_SECS,
    MAX_RETRIES_CAP, PROJECT_PATH_MAX_LEN, SSH_HOST_MAX_LEN, SSH_USER_MAX_LEN, TITLE_MAX_LEN,
};
use hub_store::{TaskFilter, TaskPage, TaskPatch, TaskStore};

use super::events::{EventBus, HubEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Draft (create-time shape)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub ai_contexts: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl TaskDraft {
    pub fn validate(&self) -> Result<()> {
        if self.title.is_empty() || self.title.len() > TITLE_MAX_LEN {
            return Err(Error::validation(format!(
                "title must be 1..={TITLE_MAX_LEN} characters"
            )));
        }
        if let Some(ref d) = self.description {
            if d.len() > DESCRIPTION_MAX_LEN {
                return Err(Error::validation(format!(
                    "description cannot exceed {DESCRIPTION_MAX_LEN} characters"
                )));
            }
        }
        if let Some(ref p) = self.project_path {
            if p.len() > PROJECT_PATH_MAX_LEN {
                return Err(Error::validation(format!(
                    "project_path cannot exceed {PROJECT_PATH_MAX_LEN} characters"
                )));
            }
        }
        if let Some(ref h) = self.ssh_host {
            if h.len() > SSH_HOST_MAX_LEN {
                return Err(Error::validation(format!(
                    "ssh_host cannot exceed {SSH_HOST_MAX_LEN} characters"
                )));
            }
        }
        if let Some(ref u) = self.ssh_user {
            if u.len() > SSH_USER_MAX_LEN {
                return Err(Error::validation(format!(
                    "ssh_user cannot exceed {SSH_USER_MAX_LEN} characters"
                )));
            }
        }
        if self.ssh_host.is_some() != self.ssh_user.is_some() {
            return Err(Error::validation(
                "ssh_host and ssh_user must be provided together",
            ));
        }
        if let Some(d) = self.estimated_duration {
            if d == 0 || d > ESTIMATED_DURATION_MAX_SECS {
                return Err(Error::validation(format!(
                    "estimated_duration must be 1..={ESTIMATED_DURATION_MAX_SECS} seconds"
                )));
            }
        }
        if let Some(r) = self.max_retries {
            if r > MAX_RETRIES_CAP {
                return Err(Error::validation(format!(
                    "max_retries must be 0..={MAX_RETRIES_CAP}"
                )));
            }
        }
        Ok(())
    }

    fn into_task(self, default_retries: u32) -> Task {
        let mut task = Task::new(self.title);
        task.description = self.description;
        task.priority = self.priority.unwrap_or_default();
        task.project_path = self.project_path;
        task.ssh_host = self.ssh_host;
        task.ssh_user = self.ssh_user;
        task.estimated_duration = self.estimated_duration;
        task.max_retries = self.max_retries.unwrap_or(default_retries);
        task.ai_contexts = self.ai_contexts.unwrap_or_default();
        task.created_by = self.created_by;
        task
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    events: Arc<EventBus>,
    default_retries: u32,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<EventBus>, default_retries: u32) -> Self {
        Self {
            store,
            events,
            default_retries: default_retries.min(MAX_RETRIES_CAP),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    // ── CRUD ───────────────────────────────────────────────────────

    pub async fn create(&self, draft: TaskDraft) -> Result<Task> {
        draft.validate()?;
        let task = self
            .store
            .create_task(draft.into_task(self.default_retries))
            .await?;
        self.events.publish(HubEvent::TaskCreated { task_id: task.id });
        tracing::info!(task_id = %task.id, title = %task.title, "task created");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store.get_task(id).await
    }

    pub async fn list(&self, filter: &TaskFilter, skip: usize, limit: usize) -> Result<TaskPage> {
        self.store.list_tasks(filter, skip, limit).await
    }

    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Task> {
        if let Some(ref title) = patch.title {
            if title.is_empty() || title.len() > TITLE_MAX_LEN {
                return Err(Error::validation(format!(
                    "title must be 1..={TITLE_MAX_LEN} characters"
                )));
            }
        }
        if let Some(ref d) = patch.description {
            if d.len() > DESCRIPTION_MAX_LEN {
                return Err(Error::validation(format!(
                    "description cannot exceed {DESCRIPTION_MAX_LEN} characters"
                )));
            }
        }
        let task = self.store.update_task(id, patch).await?;
        self.publish_updated(&task);
        Ok(task)
    }

    pub async fn delete(&self, id: Uuid, actor: Option<&str>) -> Result<bool> {
        self.store.soft_delete_task(id, actor).await
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub async fn start(&self, id: Uuid) -> Result<Task> {
        self.transition(id, |task| task.start()).await
    }

    pub async fn complete(&self, id: Uuid) -> Result<Task> {
        self.transition(id, |task| task.complete()).await
    }

    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<Task> {
        let reason = reason.to_string();
        self.transition(id, move |task| task.fail(reason)).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Task> {
        self.transition(id, |task| task.cancel()).await
    }

    pub async fn retry(&self, id: Uuid) -> Result<Task> {
        self.transition(id, |task| task.retry()).await
    }

    pub async fn advance_turn(&self, id: Uuid, next: TaskTurn) -> Result<Task> {
        self.transition(id, move |task| task.advance_turn(next)).await
    }

    /// Monotone progress bump. Explicit lowering goes through `update`.
    pub async fn update_progress(&self, id: Uuid, progress: u8) -> Result<Task> {
        self.transition(id, move |task| {
            if task.is_terminal() {
                return Err(Error::invalid_transition(
                    "cannot update progress of a terminal task",
                ));
            }
            task.set_progress(progress);
            Ok(())
        })
        .await
    }

    async fn transition<F>(&self, id: Uuid, apply: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut task = self.store.get_task(id).await?;
        apply(&mut task)?;
        self.store.save_task(&task).await?;
        self.publish_updated(&task);
        Ok(task)
    }

    fn publish_updated(&self, task: &Task) {
        self.events.publish(HubEvent::TaskUpdated {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
        });
        if task.is_terminal() {
            self.events.publish(HubEvent::TaskTerminated {
                task_id: task.id,
                status: task.status,
            });
        }
    }

    // ── Messages ───────────────────────────────────────────────────

    pub async fn record_message(
        &self,
        task_id: Uuid,
        sender: MessageSender,
        content: &str,
        related_file_name: Option<String>,
        created_by: Option<String>,
    ) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(Error::validation("message content cannot be empty"));
        }
        if content.len() > MESSAGE_CONTENT_MAX_LEN {
            return Err(Error::validation(format!(
                "message content cannot exceed {MESSAGE_CONTENT_MAX_LEN} characters"
            )));
        }
        if let Some(ref name) = related_file_name {
            if name.len() > RELATED_FILE_NAME_MAX_LEN {
                return Err(Error::validation(format!(
                    "related_file_name cannot exceed {RELATED_FILE_NAME_MAX_LEN} characters"
                )));
            }
        }

        let mut message = Message::new(task_id, sender, content);
        message.related_file_name = related_file_name;
        message.created_by = created_by;
        let message = self.store.append_message(message).await?;

        self.events.publish(HubEvent::MessageAppended {
            task_id,
            message_id: message.id,
            sender,
        });
        Ok(message)
    }

    pub async fn messages(&self, task_id: Uuid) -> Result<Vec<Message>> {
        self.store.list_messages(task_id).await
    }

    // ── Per-agent context bags ─────────────────────────────────────

    pub async fn ai_context(&self, task_id: Uuid, agent: &str) -> Result<serde_json::Value> {
        Ok(self.store.get_task(task_id).await?.ai_context(agent))
    }

    pub async fn update_ai_context(
        &self,
        task_id: Uuid,
        agent: &str,
        bag: serde_json::Value,
    ) -> Result<Task> {
        let agent = agent.to_string();
        self.transition(task_id, move |task| {
            task.update_ai_context(agent, bag);
            Ok(())
        })
        .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::task::TaskStatus;
    use hub_store::MemoryStore;

    fn engine() -> (TaskEngine, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(64));
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        (TaskEngine::new(store, events.clone(), 3), events)
    }

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_validates_title_bounds() {
        let (engine, _) = engine();
        assert!(engine.create(draft("")).await.is_err());
        assert!(engine.create(draft(&"t".repeat(255))).await.is_ok());
        assert!(engine.create(draft(&"t".repeat(256))).await.is_err());
    }

    #[tokio::test]
    async fn create_rejects_half_configured_ssh() {
        let (engine, _) = engine();
        let mut d = draft("T");
        d.ssh_host = Some("h".into());
        assert!(engine.create(d).await.is_err());

        let mut d = draft("T");
        d.ssh_host = Some("h".into());
        d.ssh_user = Some("u".into());
        let task = engine.create(d).await.unwrap();
        assert!(task.is_remote_ssh());
    }

    #[tokio::test]
    async fn create_publishes_event() {
        let (engine, events) = engine();
        let mut sub = events.subscribe();
        let task = engine.create(draft("T")).await.unwrap();
        assert!(matches!(
            sub.next().await.unwrap(),
            HubEvent::TaskCreated { task_id } if task_id == task.id
        ));
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let (engine, events) = engine();
        let task = engine.create(draft("T")).await.unwrap();
        let mut sub = events.subscribe();

        let started = engine.start(task.id).await.unwrap();
        assert_eq!(started.status, TaskStatus::ProcessingCursor);
        assert!(started.started_at.is_some());
        assert_eq!(started.progress, 5);

        let done = engine.complete(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        // Updated, then Updated + Terminated.
        assert!(matches!(sub.next().await.unwrap(), HubEvent::TaskUpdated { .. }));
        assert!(matches!(sub.next().await.unwrap(), HubEvent::TaskUpdated { .. }));
        assert!(matches!(
            sub.next().await.unwrap(),
            HubEvent::TaskTerminated { status: TaskStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn illegal_transition_is_not_persisted() {
        let (engine, _) = engine();
        let task = engine.create(draft("T")).await.unwrap();
        engine.complete(task.id).await.unwrap();

        let err = engine.start(task.id).await.unwrap_err();
        assert!(matches!(err, Error::BusinessLogic(_)));
        let current = engine.get(task.id).await.unwrap();
        assert_eq!(current.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn retry_flow_with_budget() {
        let (engine, _) = engine();
        let mut d = draft("T");
        d.max_retries = Some(1);
        let task = engine.create(d).await.unwrap();

        engine.start(task.id).await.unwrap();
        engine.fail(task.id, "llm down").await.unwrap();
        let retried = engine.retry(task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.progress <= 10);

        engine.fail(task.id, "still down").await.unwrap();
        assert!(engine.retry(task.id).await.is_err());
    }

    #[tokio::test]
    async fn advance_turn_and_self_loop() {
        let (engine, _) = engine();
        let task = engine.create(draft("T")).await.unwrap();
        engine.start(task.id).await.unwrap();

        let t = engine.advance_turn(task.id, TaskTurn::Gemini).await.unwrap();
        assert_eq!(t.status, TaskStatus::ProcessingGemini);

        let err = engine
            .advance_turn(task.id, TaskTurn::Gemini)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BusinessLogic(_)));
    }

    #[tokio::test]
    async fn progress_bump_is_monotone_but_patch_can_lower() {
        let (engine, _) = engine();
        let task = engine.create(draft("T")).await.unwrap();
        engine.start(task.id).await.unwrap();

        engine.update_progress(task.id, 50).await.unwrap();
        let t = engine.update_progress(task.id, 30).await.unwrap();
        assert_eq!(t.progress, 50);

        let t = engine
            .update(
                task.id,
                TaskPatch {
                    progress: Some(30),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(t.progress, 30);
    }

    #[tokio::test]
    async fn record_message_validates_and_publishes() {
        let (engine, events) = engine();
        let task = engine.create(draft("T")).await.unwrap();
        let mut sub = events.subscribe();

        assert!(engine
            .record_message(task.id, MessageSender::User, "  ", None, None)
            .await
            .is_err());

        let msg = engine
            .record_message(task.id, MessageSender::User, "hi", None, None)
            .await
            .unwrap();
        assert!(matches!(
            sub.next().await.unwrap(),
            HubEvent::MessageAppended { message_id, .. } if message_id == msg.id
        ));

        let over = "x".repeat(MESSAGE_CONTENT_MAX_LEN + 1);
        assert!(engine
            .record_message(task.id, MessageSender::User, &over, None, None)
            .await
            .is_err());
        let max = "x".repeat(MESSAGE_CONTENT_MAX_LEN);
        assert!(engine
            .record_message(task.id, MessageSender::User, &max, None, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn ai_context_roundtrip() {
        let (engine, _) = engine();
        let task = engine.create(draft("T")).await.unwrap();

        assert_eq!(
            engine.ai_context(task.id, "gemini").await.unwrap(),
            serde_json::json!({})
        );
        engine
            .update_ai_context(task.id, "gemini", serde_json::json!({"model": "pro"}))
            .await
            .unwrap();
        assert_eq!(
            engine.ai_context(task.id, "gemini").await.unwrap()["model"],
            "pro"
        );
    }
}
