mod connector;
mod db;
mod llm;
mod log;
mod server;
mod tasks;

pub use connector::*;
pub use db::*;
pub use llm::*;
pub use log::*;
pub use server::*;
pub use tasks::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate ranges across all sections. Errors should abort startup;
    /// warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        let mut error = |field: &str, message: String| {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.llm.context_window == 0 {
            error("llm.context_window", "must be > 0".into());
        }
        if self.llm.max_tokens >= self.llm.context_window {
            error(
                "llm.max_tokens",
                format!(
                    "reply reservation ({}) must be below context_window ({})",
                    self.llm.max_tokens, self.llm.context_window
                ),
            );
        }
        if self.llm.timeout_secs == 0 {
            error("llm.timeout_secs", "must be > 0".into());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            error("llm.temperature", "must be in 0.0..=2.0".into());
        }
        if self.connector.queue_max_size == 0 {
            error("connector.queue_max_size", "must be > 0".into());
        }
        if self.connector.command_timeout_secs == 0
            || self.connector.command_timeout_secs > 3_600
        {
            error("connector.command_timeout_secs", "must be in 1..=3600".into());
        }
        if self.connector.heartbeat_interval_secs == 0 {
            error("connector.heartbeat_interval_secs", "must be > 0".into());
        }
        if self.server.workers == 0 {
            error("server.workers", "must be > 0".into());
        }
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 || rl.burst_size == 0 {
                error(
                    "server.rate_limit",
                    "requests_per_second and burst_size must be > 0".into(),
                );
            }
        }

        if self.tasks.max_concurrent > 100 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "tasks.max_concurrent".into(),
                message: "values above 100 are clamped".into(),
            });
        }
        if self.connector.retention_window_secs < 60 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "connector.retention_window_secs".into(),
                message: "short retention windows may drop status of recently finished commands"
                    .into(),
            });
        }

        issues
    }
}
