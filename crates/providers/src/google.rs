//! Google Gemini adapter.
//!
//! Implements the Gemini `generateContent` and `streamGenerateContent`
//! APIs. Auth is via an API key passed as a query parameter
//! (`key={api_key}`).

use serde_json::Value;

use hub_domain::config::LlmConfig;
use hub_domain::error::{Error, Result};
use hub_domain::stream::{BoxStream, StreamEvent};

use crate::sse::sse_event_stream;
use crate::traits::{GenerateReply, GenerateRequest, GenerativeClient, TurnRole};
use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM client for the Google Gemini API.
pub struct GeminiClient {
    base_url: String,
    api_key: String,
    default_model: String,
    max_output_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a client from the llm config section. The API key is read
    /// once from the configured environment variable.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            Error::Configuration(format!(
                "{} environment variable is required for the Gemini client",
                cfg.api_key_env
            ))
        })?;
        if api_key.is_empty() {
            return Err(Error::Configuration(format!(
                "{} is set but empty",
                cfg.api_key_env
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            max_output_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            top_k: cfg.top_k,
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        )
    }

    fn build_body(&self, req: &GenerateRequest) -> Value {
        let contents: Vec<Value> = req.turns.iter().map(turn_to_gemini).collect();

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_output_tokens,
                "temperature": self.temperature,
                "topP": self.top_p,
                "topK": self.top_k,
            },
        });

        if let Some(ref system) = req.system_instruction {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{"text": system}]
            });
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire format helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn turn_to_gemini(turn: &crate::traits::Turn) -> Value {
    let role = match turn.role {
        TurnRole::User => "user",
        TurnRole::Model => "model",
    };
    serde_json::json!({
        "role": role,
        "parts": [{"text": turn.text}],
    })
}

/// Concatenated text of the first candidate, if any.
fn extract_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let mut text = String::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
    }
    Some(text)
}

fn extract_finish_reason(response: &Value) -> Option<String> {
    response
        .get("candidates")?
        .get(0)?
        .get("finishReason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse one SSE `data:` payload of a streamGenerateContent response.
fn parse_stream_data(data: &str) -> Vec<Result<StreamEvent>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::external(
                "gemini",
                format!("unparseable stream chunk: {e}"),
            ))]
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown streaming error");
        return vec![Ok(StreamEvent::Error {
            message: message.to_string(),
        })];
    }

    let mut events = Vec::new();
    if let Some(text) = extract_text(&value) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token { text }));
        }
    }
    if let Some(reason) = extract_finish_reason(&value) {
        events.push(Ok(StreamEvent::Done {
            finish_reason: Some(reason),
        }));
    }
    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GenerativeClient impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl GenerativeClient for GeminiClient {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateReply> {
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        let body = self.build_body(&req);

        let response = self
            .client
            .post(self.generate_url(model))
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(from_reqwest)?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(Error::external(
                "gemini",
                format!("HTTP {status}: {message}"),
            ));
        }

        let text = extract_text(&payload)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::external("gemini", "empty response"))?;

        tracing::debug!(model = %model, response_len = text.len(), "gemini reply");

        Ok(GenerateReply {
            text,
            model: model.to_string(),
            finish_reason: extract_finish_reason(&payload),
        })
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = req.model.as_deref().unwrap_or(&self.default_model);
        let body = self.build_body(&req);

        let response = self
            .client
            .post(self.stream_url(model))
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(Error::external(
                "gemini",
                format!("HTTP {status}: {message}"),
            ));
        }

        Ok(sse_event_stream(response, parse_stream_data))
    }

    fn model(&self) -> &str {
        &self.default_model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
