mod agent;
mod llm;
mod mcp;
mod sessions;
mod tools;
mod workspace;

pub use agent::*;
pub use llm::*;
pub use mcp::*;
pub use sessions::*;
pub use tools::*;
pub use workspace::*;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Config {
    /// Structural checks that serde alone cannot express.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !self.agent.model.contains('/') {
            problems.push(format!(
                "agent.model '{}' must be namespaced as <provider>/<model>",
                self.agent.model
            ));
        }
        if self.agent.max_iterations == 0 {
            problems.push("agent.max_iterations must be at least 1".into());
        }
        if self.agent.max_concurrent_turns == 0 {
            problems.push("agent.max_concurrent_turns must be at least 1".into());
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.llm.providers {
            if !seen.insert(p.id.as_str()) {
                problems.push(format!("duplicate provider id '{}'", p.id));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for s in &self.mcp.servers {
            if !seen.insert(s.name.as_str()) {
                problems.push(format!("duplicate mcp server '{}'", s.name));
            }
            match s.transport {
                McpTransportKind::Stdio if s.command.is_empty() => {
                    problems.push(format!("mcp server '{}': stdio transport needs a command", s.name));
                }
                McpTransportKind::Http if s.url.is_none() => {
                    problems.push(format!("mcp server '{}': http transport needs a url", s.name));
                }
                _ => {}
            }
        }

        problems
    }
}
