use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tools & sandbox policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Confine the shell working directory and absolute paths to the workspace.
    #[serde(default = "d_true")]
    pub restrict_to_workspace: bool,
    /// Root for the file tools. Defaults to the workspace directory.
    #[serde(default)]
    pub allowed_root: Option<PathBuf>,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            allowed_root: None,
            exec: ExecConfig::default(),
            web: WebConfig::default(),
        }
    }
}

/// Shell tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "d_60")]
    pub timeout_secs: u64,
    /// Regex patterns that are denied. Matched case-insensitively against
    /// both the raw and the decoded command.
    #[serde(default = "d_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// If non-empty, a command must match at least one of these.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default = "d_10000")]
    pub max_output_chars: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            deny_patterns: d_deny_patterns(),
            allow_patterns: Vec::new(),
            max_output_chars: 10_000,
        }
    }
}

/// Web search / fetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "d_20")]
    pub timeout_secs: u64,
    #[serde(default = "d_5")]
    pub max_redirects: usize,
    /// Max characters of extracted text returned to the model.
    #[serde(default = "d_50000")]
    pub max_chars: usize,
    /// Max response body size read from the network.
    #[serde(default = "d_5mb")]
    pub max_bytes: usize,
    /// Brave Search API key. Falls back to `BRAVE_API_KEY`.
    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default = "d_5")]
    pub search_max_results: usize,
    /// Host names always rejected, in addition to the private-network check.
    #[serde(default = "d_blocked_hosts")]
    pub blocked_hosts: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_redirects: 5,
            max_chars: 50_000,
            max_bytes: 5 * 1024 * 1024,
            search_api_key: None,
            search_max_results: 5,
            blocked_hosts: d_blocked_hosts(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_60() -> u64 {
    60
}
fn d_20() -> u64 {
    20
}
fn d_5() -> usize {
    5
}
fn d_10000() -> usize {
    10_000
}
fn d_50000() -> usize {
    50_000
}
fn d_5mb() -> usize {
    5 * 1024 * 1024
}
fn d_blocked_hosts() -> Vec<String> {
    vec!["localhost".into(), "metadata.google.internal".into()]
}
fn d_deny_patterns() -> Vec<String> {
    [
        // destructive file/disk operations
        r"\brm\s+(?:-\S*\s+)*(?:-[a-z]*[rf][a-z]*|--recursive|--force)\b",
        r"\bdel\s+/[fq]\b",
        r"\brmdir\s+/s\b",
        r"(?:^|[;&|]\s*)format\b",
        r"\b(mkfs|diskpart)\b",
        r"\bdd\s+if=",
        r">\s*/dev/sd",
        r"\b(shutdown|reboot|poweroff)\b",
        r":\(\)\s*\{.*\};\s*:",
        // meta-execution
        r"\beval\b",
        r"\bexec\b",
        r"\b(bash|sh|zsh)\s+-c\b",
        r"\bpython[23]?\s+-c\b",
        r"\b(perl|ruby|node)\s+-e\b",
        r"\|\s*(bash|sh|zsh)\b",
        r"\bbase64\s+--?d(ecode)?\b",
        // substitution / variable evasion
        r"\$\(",
        r"`",
        r"\bexport\s+\w+=",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
