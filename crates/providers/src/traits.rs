use hub_domain::error::Result;
use hub_domain::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Reply types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The role of one conversation turn as the model sees it.
///
/// System turns are never sent inline; they ride in the request's
/// dedicated system-instruction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

/// One inline conversation turn.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
        }
    }
}

/// A provider-agnostic generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// The conversation turns, oldest first. The final turn is the one
    /// being answered.
    pub turns: Vec<Turn>,
    /// System prompt for the provider's system-instruction slot.
    pub system_instruction: Option<String>,
    /// Model identifier override. `None` uses the client default.
    pub model: Option<String>,
}

/// A complete (non-streamed) generation reply.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub text: String,
    /// The model that actually produced the reply.
    pub model: String,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capability the orchestrator consumes: generate complete text, or
/// generate a stream of chunks. Adapters translate to the provider's wire
/// format; retry and timeout policy live in the orchestrator, not here.
#[async_trait::async_trait]
pub trait GenerativeClient: Send + Sync {
    /// Send a generation request and wait for the full reply.
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateReply>;

    /// Send a generation request and return a stream of events.
    async fn generate_stream(
        &self,
        req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The default model identifier for this client.
    fn model(&self) -> &str;
}
