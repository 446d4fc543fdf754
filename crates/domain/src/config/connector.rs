use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor Connector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Handshake deadline for a connecting agent.
    #[serde(default = "d_10")]
    pub connect_timeout_secs: u64,
    /// Default per-command timeout (overridable per command).
    #[serde(default = "d_300")]
    pub command_timeout_secs: u32,
    /// Retries after the first failed delivery attempt.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    #[serde(default = "d_30")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "d_1000")]
    pub queue_max_size: usize,
    #[serde(default = "d_true")]
    pub ssh_enabled: bool,
    /// How long terminal commands stay queryable before the reaper
    /// removes them.
    #[serde(default = "d_600")]
    pub retention_window_secs: u64,
    /// Grace period for a Running command to acknowledge an abort before
    /// its state is forced to Cancelled.
    #[serde(default = "d_5")]
    pub abort_grace_secs: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout_secs: 10,
            command_timeout_secs: 300,
            max_retries: 3,
            heartbeat_interval_secs: 30,
            queue_max_size: 1000,
            ssh_enabled: true,
            retention_window_secs: 600,
            abort_grace_secs: 5,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_10() -> u64 {
    10
}
fn d_300() -> u32 {
    300
}
fn d_3() -> u32 {
    3
}
fn d_30() -> u64 {
    30
}
fn d_1000() -> usize {
    1000
}
fn d_600() -> u64 {
    600
}
fn d_5() -> u64 {
    5
}
