//! Tool-server (MCP) configuration types.
//!
//! These structs deserialize the `[mcp]` section of the config. The
//! client logic lives in the `na-mcp-client` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Executables allowed as stdio servers (matched on the file name).
    #[serde(default = "d_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// Default per-call timeout for tool-server tools.
    #[serde(default = "d_30")]
    pub call_timeout_secs: u64,
    /// Minimum wait between reconnect attempts to a server that went down.
    #[serde(default = "d_30")]
    pub reconnect_cooldown_secs: u64,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            allowed_commands: d_allowed_commands(),
            call_timeout_secs: 30,
            reconnect_cooldown_secs: 30,
            servers: Vec::new(),
        }
    }
}

/// One tool-server declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name, used as the namespace of the server's tools.
    pub name: String,

    #[serde(default)]
    pub transport: McpTransportKind,

    /// Stdio: the command to spawn (e.g. `"npx"`).
    #[serde(default)]
    pub command: String,

    /// Stdio: arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Stdio: extra environment variables for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Http: endpoint URL.
    #[serde(default)]
    pub url: Option<String>,

    /// Http: extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Overrides `call_timeout_secs` for this server.
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
}

/// Transport kind for connecting to a tool server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Http,
}

impl McpTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::Stdio => "stdio",
            McpTransportKind::Http => "http",
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_allowed_commands() -> Vec<String> {
    vec!["npx".into(), "uvx".into()]
}
fn d_30() -> u64 {
    30
}
