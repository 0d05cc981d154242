use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;

use na_domain::config::AgentConfig;
use na_mcp_client::McpManager;
use na_providers::ProviderRouter;
use na_sessions::{SessionLockMap, SessionStore};

use crate::runtime::context::ContextBuilder;
use crate::runtime::tools::ToolRegistry;

/// Everything one agent loop needs, passed in explicitly.
///
/// Cloning is cheap; every clone shares the same stores, registry and
/// worker pool.
#[derive(Clone)]
pub struct EngineContext {
    pub agent: Arc<AgentConfig>,
    /// Builds each run's system prompt.
    pub context: Arc<ContextBuilder>,

    // ── Conversation state ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub session_locks: Arc<SessionLockMap>,

    // ── Model and tools ───────────────────────────────────────────────
    pub router: Arc<ProviderRouter>,
    pub tools: Arc<ToolRegistry>,
    /// Present when tool servers are configured.
    pub mcp: Option<Arc<McpManager>>,

    /// Caps inbound messages processed at once across all sessions.
    pub workers: Arc<Semaphore>,
}

impl EngineContext {
    pub fn new(
        agent: AgentConfig,
        sessions: Arc<SessionStore>,
        router: Arc<ProviderRouter>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(agent.max_concurrent_turns.max(1)));
        let context = Arc::new(ContextBuilder::new(agent.system_prompt.clone()));
        Self {
            agent: Arc::new(agent),
            context,
            sessions,
            session_locks: Arc::new(SessionLockMap::new()),
            router,
            tools,
            mcp: None,
            workers,
        }
    }

    /// Inject bootstrap files from `workspace` into system prompts.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.context = Arc::new(
            ContextBuilder::new(self.agent.system_prompt.clone()).with_workspace(workspace),
        );
        self
    }

    pub fn with_mcp(mut self, manager: Arc<McpManager>) -> Self {
        self.mcp = Some(manager);
        self
    }

    /// Close tool-server connections.
    pub async fn shutdown(&self) {
        if let Some(mcp) = &self.mcp {
            mcp.shutdown().await;
        }
    }
}
