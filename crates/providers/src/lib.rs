//! LLM client adapters.
//!
//! The orchestrator consumes the small [`traits::GenerativeClient`]
//! capability; [`google::GeminiClient`] is the production adapter for the
//! Google Gemini HTTP API.

pub mod google;
pub mod sse;
pub mod traits;
mod util;

pub use google::GeminiClient;
pub use traits::{GenerateReply, GenerateRequest, GenerativeClient, Turn, TurnRole};
