//! Shared scripted doubles for end-to-end gateway tests.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use hub_domain::command::SshContext;
use hub_domain::config::Config;
use hub_domain::error::{Error, Result};
use hub_domain::stream::{BoxStream, StreamEvent};
use hub_gateway::connector::{CommandReply, ConnectorLink, ConnectorTransport};
use hub_gateway::state::AppState;
use hub_providers::{GenerateReply, GenerateRequest, GenerativeClient};
use hub_store::MemoryStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the scripted model behaves on each call.
pub enum LlmScript {
    /// Always return this text (streamed as one chunk per word).
    Reply(String),
    /// Always fail.
    Fail,
    /// Stream two chunks then hang until cancelled.
    StallAfterTwoChunks,
}

pub struct ScriptedLlm {
    pub script: LlmScript,
    pub calls: AtomicU32,
}

impl ScriptedLlm {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            script: LlmScript::Reply(text.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            script: LlmScript::Fail,
            calls: AtomicU32::new(0),
        })
    }

    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            script: LlmScript::StallAfterTwoChunks,
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl GenerativeClient for ScriptedLlm {
    async fn generate(&self, _req: GenerateRequest) -> Result<GenerateReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            LlmScript::Reply(text) => Ok(GenerateReply {
                text: text.clone(),
                model: "scripted".into(),
                finish_reason: Some("stop".into()),
            }),
            _ => Err(Error::external("gemini", "scripted failure")),
        }
    }

    async fn generate_stream(
        &self,
        _req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            LlmScript::Reply(text) => {
                let words: Vec<String> =
                    text.split_whitespace().map(|w| format!("{w} ")).collect();
                Ok(Box::pin(async_stream::stream! {
                    for word in words {
                        yield Ok(StreamEvent::Token { text: word });
                    }
                    yield Ok(StreamEvent::Done { finish_reason: Some("stop".into()) });
                }))
            }
            LlmScript::Fail => Err(Error::external("gemini", "scripted failure")),
            LlmScript::StallAfterTwoChunks => Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamEvent::Token { text: "chunk one ".into() });
                yield Ok(StreamEvent::Token { text: "chunk two ".into() });
                std::future::pending::<()>().await;
                yield Ok(StreamEvent::Done { finish_reason: None });
            })),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScriptedTransport {
    connected_tx: watch::Sender<bool>,
    pub delivered: Mutex<Vec<hub_protocol::CommandEnvelope>>,
    pub aborted: Mutex<Vec<Uuid>>,
    heartbeat: RwLock<Option<DateTime<Utc>>>,
}

impl ScriptedTransport {
    pub fn new(connected: bool) -> Arc<Self> {
        let (connected_tx, _rx) = watch::channel(connected);
        Arc::new(Self {
            connected_tx,
            delivered: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            heartbeat: RwLock::new(None),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        let _ = self.connected_tx.send(connected);
    }

    pub fn delivered_contents(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|e| e.content.clone())
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

    async fn deliver(
        &self,
        envelope: hub_protocol::CommandEnvelope,
    ) -> Result<CommandReply> {
        self.delivered.lock().push(envelope);
        Ok(CommandReply {
            success: true,
            response: Some("done".into()),
            error: None,
        })
    }

    async fn abort(&self, command_id: Uuid) -> bool {
        self.aborted.lock().push(command_id);
        true
    }

    async fn verify(&self, _ssh: SshContext) -> Result<bool> {
        Ok(self.is_connected())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn app_state(
    llm: Arc<dyn GenerativeClient>,
    transport: Arc<dyn ConnectorTransport>,
    tweak: impl FnOnce(&mut Config),
) -> AppState {
    let mut config = Config::default();
    config.connector.abort_grace_secs = 1;
    config.llm.timeout_secs = 5;
    tweak(&mut config);
    AppState::build(
        Arc::new(config),
        Arc::new(MemoryStore::new()),
        llm,
        transport,
        Arc::new(ConnectorLink::new()),
    )
}
