//! Conversation orchestrator.
//!
//! Owns the per-task conversation contexts and drives the LLM. Sends for
//! one task serialize in submission order behind a per-task lock; sends
//! for different tasks run in parallel. Complete sends retry with
//! exponential backoff inside the configured budget; streaming sends never
//! retry mid-stream and discard partial replies on failure or cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use futures_util::StreamExt;

use hub_domain::config::LlmConfig;
use hub_domain::error::{Error, Result};
use hub_domain::message::MessageSender;
use hub_domain::stream::StreamEvent;
use hub_providers::{GenerateRequest, GenerativeClient, Turn};

use super::cancel::CancelMap;
use super::context::{ConversationContext, ConversationRole, ConversationSummary};
use super::engine::TaskEngine;
use super::events::{EventBus, HubEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-task send serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `Semaphore(1)` per task id. Tokio semaphores queue waiters fairly,
/// so concurrent sends for the same task run in submission order.
struct SendLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl SendLockMap {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, task_id: Uuid) -> Result<OwnedSemaphorePermit> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(task_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned()
            .await
            .map_err(|_| Error::Internal("send lock closed".into()))
    }

    fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a complete (non-streamed) send.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub reply: String,
    pub model: String,
    pub conversation_summary: ConversationSummary,
}

/// One item of a streamed send. Every stream ends with exactly one of the
/// terminal variants.
#[derive(Debug, Clone)]
pub enum SendEvent {
    Chunk(String),
    /// Stream finished; the full reply was appended to the context.
    Complete { full_response: String, model: String },
    /// Cancelled mid-stream; the partial reply was discarded.
    Cancelled,
    /// Failed mid-stream; the partial reply was discarded.
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorHealth {
    pub status: &'static str,
    pub model: String,
    pub active_conversations: usize,
    pub test_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    llm: Arc<dyn GenerativeClient>,
    engine: Arc<TaskEngine>,
    events: Arc<EventBus>,
    config: LlmConfig,
    contexts: Arc<Mutex<HashMap<Uuid, ConversationContext>>>,
    locks: Arc<SendLockMap>,
    cancels: Arc<CancelMap>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn GenerativeClient>,
        engine: Arc<TaskEngine>,
        events: Arc<EventBus>,
        config: LlmConfig,
    ) -> Self {
        Self {
            llm,
            engine,
            events,
            config,
            contexts: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(SendLockMap::new()),
            cancels: Arc::new(CancelMap::new()),
        }
    }

    // ── Conversation lifecycle ─────────────────────────────────────

    /// Create (or recreate) the conversation context for a task.
    pub fn create_conversation(
        &self,
        task_id: Uuid,
        system_prompt: Option<String>,
    ) -> ConversationSummary {
        let ctx = ConversationContext::new(task_id, system_prompt);
        let summary = ctx.summary();
        self.contexts.lock().insert(task_id, ctx);
        tracing::info!(task_id = %task_id, "conversation context created");
        summary
    }

    pub fn conversation_summary(&self, task_id: Uuid) -> Option<ConversationSummary> {
        self.contexts.lock().get(&task_id).map(|c| c.summary())
    }

    /// Drop a conversation context. Idempotent; returns whether one existed.
    pub fn clear(&self, task_id: Uuid) -> bool {
        self.contexts.lock().remove(&task_id).is_some()
    }

    pub fn active_conversations(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Cancel the in-flight send for a task, if any. Suppresses further
    /// retries and ends a running stream with its end-of-stream marker.
    pub fn cancel_send(&self, task_id: Uuid) -> bool {
        self.cancels.cancel(task_id)
    }

    /// Evict contexts whose task is gone or terminal. Called by the
    /// cleanup worker; errors for individual tasks are logged, never
    /// propagated.
    pub async fn evict_terminated(&self) -> usize {
        let task_ids: Vec<Uuid> = self.contexts.lock().keys().copied().collect();
        let mut evicted = 0;
        for task_id in task_ids {
            let drop_it = match self.engine.get(task_id).await {
                Ok(task) => task.is_terminal(),
                Err(Error::NotFound { .. }) => true,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "eviction check failed");
                    false
                }
            };
            if drop_it && self.clear(task_id) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted terminal conversation contexts");
        }
        evicted
    }

    /// Prune idle per-task send locks.
    pub fn prune_idle_locks(&self) {
        self.locks.prune_idle();
    }

    // ── Complete send ──────────────────────────────────────────────

    pub async fn send(
        &self,
        task_id: Uuid,
        message: &str,
        role: ConversationRole,
        metadata: Option<serde_json::Value>,
    ) -> Result<SendOutcome> {
        validate_message(message)?;
        // The task must exist; sends do not resurrect deleted tasks.
        self.engine.get(task_id).await?;

        let _permit = self.locks.acquire(task_id).await?;
        let token = self.cancels.register(task_id);

        let result = self
            .send_locked(task_id, message, role, metadata, token)
            .await;
        self.cancels.remove(task_id);
        result
    }

    async fn send_locked(
        &self,
        task_id: Uuid,
        message: &str,
        role: ConversationRole,
        metadata: Option<serde_json::Value>,
        token: CancellationToken,
    ) -> Result<SendOutcome> {
        let request = self.append_user_turn(task_id, message, role, metadata).await?;

        let reply = self.generate_with_retry(task_id, request, &token).await?;

        let summary = self.append_assistant_turn(task_id, &reply.text).await?;
        self.events.publish(HubEvent::ConversationComplete {
            task_id,
            response_length: reply.text.len(),
        });

        Ok(SendOutcome {
            reply: reply.text,
            model: reply.model,
            conversation_summary: summary,
        })
    }

    async fn generate_with_retry(
        &self,
        task_id: Uuid,
        request: GenerateRequest,
        token: &CancellationToken,
    ) -> Result<hub_providers::GenerateReply> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(Error::BusinessLogic("send cancelled".into()));
            }

            let outcome = tokio::select! {
                res = tokio::time::timeout(timeout, self.llm.generate(request.clone())) => {
                    match res {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
                    }
                }
                _ = token.cancelled() => {
                    return Err(Error::BusinessLogic("send cancelled".into()));
                }
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(message) => {
                    if attempt >= max_retries {
                        return Err(Error::external(
                            "gemini",
                            format!("failed after {} attempts: {message}", attempt + 1),
                        ));
                    }
                    attempt += 1;
                    let wait = Duration::from_secs((1u64 << attempt).min(30));
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        max_retries,
                        wait_secs = wait.as_secs(),
                        error = %message,
                        "llm call failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => {
                            return Err(Error::BusinessLogic("send cancelled".into()));
                        }
                    }
                }
            }
        }
    }

    // ── Streaming send ─────────────────────────────────────────────

    /// Start a streamed send. The returned receiver is single-consumer
    /// and finite: it yields zero or more `Chunk`s followed by exactly one
    /// terminal event.
    pub async fn send_stream(
        &self,
        task_id: Uuid,
        message: &str,
        role: ConversationRole,
        metadata: Option<serde_json::Value>,
    ) -> Result<mpsc::Receiver<SendEvent>> {
        validate_message(message)?;
        self.engine.get(task_id).await?;

        let permit = self.locks.acquire(task_id).await?;
        let token = self.cancels.register(task_id);

        let request = match self.append_user_turn(task_id, message, role, metadata).await {
            Ok(req) => req,
            Err(e) => {
                self.cancels.remove(task_id);
                return Err(e);
            }
        };

        // Streaming never retries: one connection attempt, bounded by the
        // configured timeout.
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let stream = match tokio::time::timeout(timeout, self.llm.generate_stream(request)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.cancels.remove(task_id);
                return Err(e);
            }
            Err(_) => {
                self.cancels.remove(task_id);
                return Err(Error::external(
                    "gemini",
                    format!("stream open timed out after {}s", timeout.as_secs()),
                ));
            }
        };

        self.events
            .publish(HubEvent::ConversationStreamStart { task_id });

        let (tx, rx) = mpsc::channel::<SendEvent>(32);
        let driver = StreamDriver {
            task_id,
            model: self.llm.model().to_string(),
            contexts: self.contexts.clone(),
            engine: self.engine.clone(),
            events: self.events.clone(),
            cancels: self.cancels.clone(),
        };
        tokio::spawn(driver.run(stream, tx, token, permit));

        Ok(rx)
    }

    // ── Health ─────────────────────────────────────────────────────

    pub async fn health(&self) -> OrchestratorHealth {
        let probe = GenerateRequest {
            turns: vec![Turn::user("Health check test. Please respond with 'OK'.")],
            system_instruction: None,
            model: None,
        };
        let result =
            tokio::time::timeout(Duration::from_secs(10), self.llm.generate(probe)).await;

        match result {
            Ok(Ok(reply)) => {
                let passed = reply.text.to_uppercase().contains("OK");
                OrchestratorHealth {
                    status: if passed { "healthy" } else { "degraded" },
                    model: self.llm.model().to_string(),
                    active_conversations: self.active_conversations(),
                    test_passed: passed,
                    error: None,
                }
            }
            Ok(Err(e)) => OrchestratorHealth {
                status: "unhealthy",
                model: self.llm.model().to_string(),
                active_conversations: self.active_conversations(),
                test_passed: false,
                error: Some(e.to_string()),
            },
            Err(_) => OrchestratorHealth {
                status: "unhealthy",
                model: self.llm.model().to_string(),
                active_conversations: self.active_conversations(),
                test_passed: false,
                error: Some("health probe timed out".into()),
            },
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────

    /// Record the inbound turn (store + context) and build the request
    /// from the optimized history.
    async fn append_user_turn(
        &self,
        task_id: Uuid,
        message: &str,
        role: ConversationRole,
        metadata: Option<serde_json::Value>,
    ) -> Result<GenerateRequest> {
        self.engine
            .record_message(task_id, sender_for(role), message, None, None)
            .await?;

        let mut contexts = self.contexts.lock();
        let ctx = contexts
            .entry(task_id)
            .or_insert_with(|| ConversationContext::new(task_id, None));
        ctx.push(role, message, metadata.unwrap_or_else(|| serde_json::json!({})));
        ctx.optimize(self.config.history_budget());

        Ok(build_request(ctx))
    }

    async fn append_assistant_turn(
        &self,
        task_id: Uuid,
        reply: &str,
    ) -> Result<ConversationSummary> {
        let summary = {
            let mut contexts = self.contexts.lock();
            let ctx = contexts
                .entry(task_id)
                .or_insert_with(|| ConversationContext::new(task_id, None));
            ctx.push(
                ConversationRole::Assistant,
                reply,
                serde_json::json!({"model": self.llm.model()}),
            );
            ctx.summary()
        };
        self.engine
            .record_message(task_id, MessageSender::Gemini, reply, None, None)
            .await?;
        Ok(summary)
    }
}

fn validate_message(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        return Err(Error::validation("message cannot be empty"));
    }
    Ok(())
}

fn sender_for(role: ConversationRole) -> MessageSender {
    match role {
        ConversationRole::User => MessageSender::User,
        ConversationRole::Assistant => MessageSender::Gemini,
        ConversationRole::System => MessageSender::System,
    }
}

/// Map the optimized history to the provider request. System turns ride
/// in the system-instruction slot; assistant becomes the model role;
/// anything else is sent as user.
fn build_request(ctx: &ConversationContext) -> GenerateRequest {
    let mut turns = Vec::with_capacity(ctx.history.len());
    for entry in &ctx.history {
        match entry.role {
            ConversationRole::System => {}
            ConversationRole::Assistant => turns.push(Turn::model(entry.content.clone())),
            ConversationRole::User => turns.push(Turn::user(entry.content.clone())),
        }
    }
    GenerateRequest {
        turns,
        system_instruction: ctx.system_prompt.clone(),
        model: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StreamDriver {
    task_id: Uuid,
    model: String,
    contexts: Arc<Mutex<HashMap<Uuid, ConversationContext>>>,
    engine: Arc<TaskEngine>,
    events: Arc<EventBus>,
    cancels: Arc<CancelMap>,
}

enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl StreamDriver {
    async fn run(
        self,
        mut stream: hub_domain::stream::BoxStream<'static, Result<StreamEvent>>,
        tx: mpsc::Sender<SendEvent>,
        token: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let task_id = self.task_id;
        let mut full = String::new();

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break StreamOutcome::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(StreamEvent::Token { text })) => {
                        full.push_str(&text);
                        self.events.publish(HubEvent::ConversationStreamChunk {
                            task_id,
                            content: text.clone(),
                        });
                        if tx.send(SendEvent::Chunk(text)).await.is_err() {
                            // Consumer went away; treat like a cancel.
                            break StreamOutcome::Cancelled;
                        }
                    }
                    Some(Ok(StreamEvent::Done { .. })) | None => break StreamOutcome::Completed,
                    Some(Ok(StreamEvent::Error { message })) => {
                        break StreamOutcome::Failed(message)
                    }
                    Some(Err(e)) => break StreamOutcome::Failed(e.to_string()),
                }
            }
        };

        match outcome {
            StreamOutcome::Completed if !full.is_empty() => {
                {
                    let mut contexts = self.contexts.lock();
                    let ctx = contexts
                        .entry(task_id)
                        .or_insert_with(|| ConversationContext::new(task_id, None));
                    ctx.push(
                        ConversationRole::Assistant,
                        full.clone(),
                        serde_json::json!({"model": self.model, "streaming": true}),
                    );
                }
                if let Err(e) = self
                    .engine
                    .record_message(task_id, MessageSender::Gemini, &full, None, None)
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "failed to persist streamed reply");
                }
                self.events.publish(HubEvent::ConversationStreamEnd {
                    task_id,
                    full_length: full.len(),
                });
                self.events.publish(HubEvent::ConversationComplete {
                    task_id,
                    response_length: full.len(),
                });
                let _ = tx
                    .send(SendEvent::Complete {
                        full_response: full,
                        model: self.model.clone(),
                    })
                    .await;
            }
            StreamOutcome::Completed => {
                self.events.publish(HubEvent::ConversationStreamEnd {
                    task_id,
                    full_length: 0,
                });
                let _ = tx
                    .send(SendEvent::Failed {
                        message: "empty response from model".into(),
                    })
                    .await;
            }
            StreamOutcome::Cancelled => {
                // The partial reply is discarded, not appended.
                self.events.publish(HubEvent::ConversationStreamEnd {
                    task_id,
                    full_length: 0,
                });
                let _ = tx.send(SendEvent::Cancelled).await;
                tracing::info!(task_id = %task_id, discarded = full.len(), "stream cancelled");
            }
            StreamOutcome::Failed(message) => {
                self.events.publish(HubEvent::ConversationStreamEnd {
                    task_id,
                    full_length: 0,
                });
                let _ = tx.send(SendEvent::Failed { message }).await;
            }
        }

        self.cancels.remove(task_id);
        drop(permit);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
