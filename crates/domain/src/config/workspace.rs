use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root for file tools and the shell working directory.
    #[serde(default = "d_ws_path")]
    pub path: PathBuf,
    /// Sessions, cron jobs and other engine state.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: d_ws_path(),
            state_path: d_state_path(),
        }
    }
}

impl WorkspaceConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }

    pub fn resolved_state_path(&self) -> PathBuf {
        expand_home(&self.state_path)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ws_path() -> PathBuf {
    PathBuf::from("~/.nanoagent/workspace")
}
fn d_state_path() -> PathBuf {
    PathBuf::from("~/.nanoagent/state")
}
