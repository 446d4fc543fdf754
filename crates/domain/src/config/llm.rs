use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM (Gemini)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Env var containing the Gemini API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Maximum tokens reserved for the model's reply.
    #[serde(default = "d_8192")]
    pub max_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    #[serde(default = "d_top_p")]
    pub top_p: f32,
    #[serde(default = "d_top_k")]
    pub top_k: u32,
    /// Retries after the first failed attempt.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Per-request timeout.
    #[serde(default = "d_30")]
    pub timeout_secs: u64,
    /// Estimated-token budget for any single request (history + reply).
    #[serde(default = "d_32000")]
    pub context_window: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: d_api_key_env(),
            base_url: d_base_url(),
            model: d_model(),
            max_tokens: 8_192,
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_retries: 3,
            timeout_secs: 30,
            context_window: 32_000,
        }
    }
}

impl LlmConfig {
    /// Token budget left for conversation history once the reply
    /// reservation is subtracted.
    pub fn history_budget(&self) -> u32 {
        self.context_window.saturating_sub(self.max_tokens)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_api_key_env() -> String {
    "GEMINI_API_KEY".into()
}
fn d_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn d_model() -> String {
    "gemini-1.5-pro-latest".into()
}
fn d_8192() -> u32 {
    8_192
}
fn d_temperature() -> f32 {
    0.7
}
fn d_top_p() -> f32 {
    0.8
}
fn d_top_k() -> u32 {
    40
}
fn d_3() -> u32 {
    3
}
fn d_30() -> u64 {
    30
}
fn d_32000() -> u32 {
    32_000
}
