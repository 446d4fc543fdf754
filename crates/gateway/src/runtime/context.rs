//! In-memory conversation context.
//!
//! One context per task drives the LLM; it is separate from the persisted
//! message history. Token counts are a stable approximation (4 chars per
//! token, rounded up) — precision is not required, only that the same text
//! always costs the same.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// ceil(chars / 4)
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub task_id: Uuid,
    pub history: Vec<HistoryEntry>,
    pub system_prompt: Option<String>,
    pub estimated_tokens: u32,
    pub last_updated: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(task_id: Uuid, system_prompt: Option<String>) -> Self {
        let mut ctx = Self {
            task_id,
            history: Vec::new(),
            system_prompt: system_prompt.clone(),
            estimated_tokens: 0,
            last_updated: Utc::now(),
        };
        if let Some(prompt) = system_prompt {
            ctx.push(
                ConversationRole::System,
                prompt,
                serde_json::json!({"kind": "system_prompt"}),
            );
        }
        ctx
    }

    pub fn push(
        &mut self,
        role: ConversationRole,
        content: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        let content = content.into();
        self.estimated_tokens += estimate_tokens(&content);
        self.history.push(HistoryEntry {
            role,
            content,
            timestamp: Utc::now(),
            metadata,
        });
        self.last_updated = Utc::now();
    }

    /// Drop the oldest non-system turns until the estimate fits `budget`.
    ///
    /// The system turn, when present, is always retained and placed first;
    /// the remaining history is a contiguous suffix of the most recent
    /// turns.
    pub fn optimize(&mut self, budget: u32) {
        if self.estimated_tokens <= budget {
            return;
        }

        let system: Option<HistoryEntry> = self
            .history
            .iter()
            .find(|e| e.role == ConversationRole::System)
            .cloned();
        let mut tokens = system
            .as_ref()
            .map(|e| estimate_tokens(&e.content))
            .unwrap_or(0);

        // Walk newest-to-oldest, keeping what still fits.
        let mut kept: Vec<HistoryEntry> = Vec::new();
        for entry in self
            .history
            .iter()
            .rev()
            .filter(|e| e.role != ConversationRole::System)
        {
            let cost = estimate_tokens(&entry.content);
            if tokens + cost > budget {
                break;
            }
            tokens += cost;
            kept.push(entry.clone());
        }
        kept.reverse();

        let mut history = Vec::with_capacity(kept.len() + 1);
        if let Some(system) = system {
            history.push(system);
        }
        history.extend(kept);

        let dropped = self.history.len() - history.len();
        self.history = history;
        self.estimated_tokens = tokens;
        tracing::debug!(
            task_id = %self.task_id,
            dropped,
            estimated_tokens = tokens,
            "conversation context truncated"
        );
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            task_id: self.task_id,
            message_count: self.history.len(),
            estimated_tokens: self.estimated_tokens,
            last_updated: self.last_updated,
            has_system_prompt: self.system_prompt.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub task_id: Uuid,
    pub message_count: usize,
    pub estimated_tokens: u32,
    pub last_updated: DateTime<Utc>,
    pub has_system_prompt: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }

    #[test]
    fn new_with_system_prompt_records_first_entry() {
        let ctx = ConversationContext::new(Uuid::new_v4(), Some("be brief".into()));
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].role, ConversationRole::System);
        assert!(ctx.summary().has_system_prompt);
    }

    #[test]
    fn push_accumulates_tokens() {
        let mut ctx = ConversationContext::new(Uuid::new_v4(), None);
        ctx.push(ConversationRole::User, "x".repeat(40), serde_json::json!({}));
        ctx.push(ConversationRole::Assistant, "y".repeat(20), serde_json::json!({}));
        assert_eq!(ctx.estimated_tokens, 15);
        assert_eq!(ctx.history.len(), 2);
    }

    #[test]
    fn optimize_noop_under_budget() {
        let mut ctx = ConversationContext::new(Uuid::new_v4(), None);
        ctx.push(ConversationRole::User, "short", serde_json::json!({}));
        let before = ctx.history.len();
        ctx.optimize(1000);
        assert_eq!(ctx.history.len(), before);
    }

    #[test]
    fn optimize_drops_oldest_keeps_recent_suffix() {
        let mut ctx = ConversationContext::new(Uuid::new_v4(), None);
        // 50 turns of 40 chars = 10 tokens each.
        for i in 0..50 {
            ctx.push(
                ConversationRole::User,
                format!("{i:02}{}", "x".repeat(38)),
                serde_json::json!({}),
            );
        }
        assert_eq!(ctx.estimated_tokens, 500);

        ctx.optimize(80);
        assert!(ctx.estimated_tokens <= 80);
        assert_eq!(ctx.history.len(), 8);
        // Most recent turns retained contiguously.
        assert!(ctx.history[0].content.starts_with("42"));
        assert!(ctx.history[7].content.starts_with("49"));
    }

    #[test]
    fn optimize_always_retains_system_first() {
        let mut ctx =
            ConversationContext::new(Uuid::new_v4(), Some("s".repeat(40))); // 10 tokens
        for _ in 0..20 {
            ctx.push(ConversationRole::User, "x".repeat(40), serde_json::json!({}));
        }

        ctx.optimize(50);
        assert!(ctx.estimated_tokens <= 50);
        assert_eq!(ctx.history[0].role, ConversationRole::System);
        // 10 for system + 4 * 10 for retained turns.
        assert_eq!(ctx.history.len(), 5);
    }

    #[test]
    fn optimize_with_budget_below_single_turn_keeps_only_system() {
        let mut ctx = ConversationContext::new(Uuid::new_v4(), Some("sys".into()));
        ctx.push(ConversationRole::User, "x".repeat(400), serde_json::json!({}));
        ctx.optimize(10);
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].role, ConversationRole::System);
    }

    #[test]
    fn summary_counts() {
        let mut ctx = ConversationContext::new(Uuid::new_v4(), None);
        ctx.push(ConversationRole::User, "hi", serde_json::json!({}));
        ctx.push(ConversationRole::Assistant, "OK", serde_json::json!({}));
        let summary = ctx.summary();
        assert_eq!(summary.message_count, 2);
        assert!(!summary.has_system_prompt);
        assert_eq!(summary.estimated_tokens, 2);
    }
}
