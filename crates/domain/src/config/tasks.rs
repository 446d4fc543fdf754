use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Upper bound on a task's wall-clock run time.
    #[serde(default = "d_3600")]
    pub max_duration_secs: u64,
    /// Period of the retention/cleanup worker loop.
    #[serde(default = "d_300")]
    pub cleanup_interval_secs: u64,
    /// Maximum tasks processed concurrently.
    #[serde(default = "d_10")]
    pub max_concurrent: usize,
    /// Default retry budget for new tasks.
    #[serde(default = "d_3")]
    pub retry_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 3_600,
            cleanup_interval_secs: 300,
            max_concurrent: 10,
            retry_attempts: 3,
        }
    }
}

impl TaskConfig {
    /// Clamp settings into safe operating ranges.
    pub fn clamped(&self) -> Self {
        Self {
            max_duration_secs: self.max_duration_secs.clamp(60, 86_400),
            cleanup_interval_secs: self.cleanup_interval_secs.clamp(10, 3_600),
            max_concurrent: self.max_concurrent.clamp(1, 100),
            retry_attempts: self.retry_attempts.min(10),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3600() -> u64 {
    3_600
}
fn d_300() -> u64 {
    300
}
fn d_10() -> usize {
    10
}
fn d_3() -> u32 {
    3
}
