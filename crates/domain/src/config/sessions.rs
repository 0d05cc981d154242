use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Sessions idle for longer than this are evicted on next access.
    #[serde(default = "d_30")]
    pub ttl_days: u32,
    /// Directory holding one `<key>.jsonl` file per session.
    /// Defaults to `<workspace.state_path>/sessions`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            dir: None,
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ttl_days))
    }
}

fn d_30() -> u32 {
    30
}
