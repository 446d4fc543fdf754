use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Backend connection URL. `memory://` selects the in-memory reference
    /// store; any other scheme is for an external backend implementation.
    #[serde(default = "d_url")]
    pub url: String,
    /// Echo statements at debug level.
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "d_5")]
    pub pool_size: usize,
    #[serde(default = "d_10")]
    pub max_overflow: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: d_url(),
            echo: false,
            pool_size: 5,
            max_overflow: 10,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_url() -> String {
    "memory://".into()
}
fn d_5() -> usize {
    5
}
fn d_10() -> usize {
    10
}
