//! EngineContext construction shared by every CLI command that runs the
//! agent.

use std::sync::Arc;

use anyhow::Context;

use na_domain::config::Config;
use na_mcp_client::McpManager;
use na_providers::{ProviderRegistry, ProviderRouter};
use na_sessions::SessionStore;
use na_tools::{builtin_tools, OutboundSink};

use crate::runtime::mcp::connect_server;
use crate::runtime::tools::ToolRegistry;
use crate::state::EngineContext;

/// Validate config, initialize every subsystem and return a wired
/// [`EngineContext`].
///
/// A tool server that fails to start is logged and skipped; the agent runs
/// with whatever connected.
pub async fn build_engine(
    config: &Config,
    outbound: Option<Arc<dyn OutboundSink>>,
) -> anyhow::Result<EngineContext> {
    let registry = ProviderRegistry::from_config(&config.llm);
    if registry.is_empty() {
        tracing::warn!("no LLM providers available; every model call will fail");
    } else {
        tracing::info!(providers = ?registry.list_providers(), "LLM providers ready");
    }
    let router = ProviderRouter::from_config(&config.llm, registry);
    build_engine_with_router(config, router, outbound).await
}

/// [`build_engine`] with a caller-supplied router.
pub async fn build_engine_with_router(
    config: &Config,
    router: ProviderRouter,
    outbound: Option<Arc<dyn OutboundSink>>,
) -> anyhow::Result<EngineContext> {
    // ── Config validation ────────────────────────────────────────────
    let problems = config.validate();
    for p in &problems {
        tracing::error!("config: {p}");
    }
    if !problems.is_empty() {
        anyhow::bail!("config validation failed with {} error(s)", problems.len());
    }

    // ── Directories ──────────────────────────────────────────────────
    let workspace = config.workspace.resolved_path();
    let state_dir = config.workspace.resolved_state_path();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    // ── Sessions ─────────────────────────────────────────────────────
    let sessions_dir = config
        .sessions
        .dir
        .as_deref()
        .map(na_domain::config::expand_home)
        .unwrap_or_else(|| state_dir.join("sessions"));
    let sessions = Arc::new(
        SessionStore::new(&sessions_dir, config.sessions.ttl()).context("opening session store")?,
    );
    tracing::info!(dir = %sessions_dir.display(), ttl_days = config.sessions.ttl_days, "session store ready");

    // ── Built-in tools ───────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    for tool in builtin_tools(&config.tools, &workspace, &state_dir, outbound)
        .context("initializing built-in tools")?
    {
        tools.register_builtin(tool).context("registering built-in tool")?;
    }
    tracing::info!(count = tools.len(), "built-in tools registered");

    let mut ctx = EngineContext::new(config.agent.clone(), sessions, Arc::new(router), tools.clone())
        .with_workspace(&workspace);

    // ── Tool servers ─────────────────────────────────────────────────
    if !config.mcp.servers.is_empty() {
        let manager = Arc::new(McpManager::new(&config.mcp));
        for server in &config.mcp.servers {
            match connect_server(&tools, &manager, server).await {
                Ok(reg) => {
                    for (name, reason) in &reg.rejected {
                        tracing::warn!(server = %server.name, tool = %name, reason = %reason, "tool not registered");
                    }
                    tracing::info!(
                        server = %server.name,
                        tools = reg.registered.len(),
                        "tool server registered"
                    );
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, error = %e, "tool server unavailable, continuing without it");
                }
            }
        }
        ctx = ctx.with_mcp(manager);
    }

    Ok(ctx)
}
