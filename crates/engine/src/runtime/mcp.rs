//! Bridges tool-server tools into the [`ToolRegistry`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use na_domain::config::McpServerConfig;
use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use na_mcp_client::{McpError, McpManager, RemoteTool, ToolCallResult};
use na_tools::{InvokeResult, ToolContext, ToolInvoker, ToolOutput};

use super::tools::{ToolDescriptor, ToolOrigin, ToolRegistry};

/// Slack on top of the server's own call timeout, so the manager reports
/// the timeout before the dispatcher cuts the call off.
const DISPATCH_GRACE: Duration = Duration::from_secs(2);

/// Invokes one remote tool through the shared manager.
pub struct McpToolInvoker {
    manager: Arc<McpManager>,
    server: String,
    /// Name as declared by the server (not the namespaced registry name).
    tool: String,
}

impl McpToolInvoker {
    pub fn new(manager: Arc<McpManager>, server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            manager,
            server: server.into(),
            tool: tool.into(),
        }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for McpToolInvoker {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        self.manager
            .invoke(&self.server, &self.tool, args)
            .await
            .map(into_output)
            .map_err(ToolError::from)
    }
}

fn into_output(result: ToolCallResult) -> ToolOutput {
    let text = result.text();
    match result.structured_content {
        Some(structured) if text.is_empty() => ToolOutput::json(structured),
        Some(structured) => ToolOutput::json(json!({ "text": text, "structured": structured })),
        None => ToolOutput::text(text),
    }
}

/// Outcome of merging one server's tools.
#[derive(Debug, Default)]
pub struct ServerRegistration {
    pub registered: Vec<String>,
    /// `(name, reason)` of tools that could not be registered.
    pub rejected: Vec<(String, String)>,
}

/// Connect `config` and register its tools under the server's namespace.
/// Name collisions reject the colliding tool only.
pub async fn connect_server(
    registry: &ToolRegistry,
    manager: &Arc<McpManager>,
    config: &McpServerConfig,
) -> Result<ServerRegistration, McpError> {
    let tools = manager.connect(config).await?;
    let timeout = manager.tool_timeout(&config.name) + DISPATCH_GRACE;
    Ok(register_remote_tools(registry, manager, tools, timeout))
}

fn register_remote_tools(
    registry: &ToolRegistry,
    manager: &Arc<McpManager>,
    tools: Vec<RemoteTool>,
    timeout: Duration,
) -> ServerRegistration {
    let mut outcome = ServerRegistration::default();
    for tool in tools {
        let description = if tool.def.description.is_empty() {
            format!("Tool '{}' from server '{}'", tool.def.name, tool.server)
        } else {
            tool.def.description.clone()
        };
        let descriptor = ToolDescriptor {
            definition: ToolDefinition {
                name: tool.registered_name.clone(),
                description,
                parameters: tool.def.input_schema.clone(),
            },
            origin: ToolOrigin::Server(tool.server.clone()),
            timeout,
        };
        let invoker = Arc::new(McpToolInvoker::new(manager.clone(), &tool.server, &tool.def.name));
        match registry.register(descriptor, invoker) {
            Ok(()) => outcome.registered.push(tool.registered_name),
            Err(e) => {
                tracing::warn!(server = %tool.server, tool = %tool.registered_name, error = %e, "tool rejected");
                outcome.rejected.push((tool.registered_name, e.to_string()));
            }
        }
    }
    outcome
}

/// Stop a server and drop its tools from the registry.
pub async fn disconnect_server(registry: &ToolRegistry, manager: &McpManager, server: &str) -> bool {
    let removed = registry.unregister_origin(&ToolOrigin::Server(server.to_string()));
    let known = manager.disconnect(server).await;
    tracing::info!(server = %server, tools_removed = removed, "tool server removed");
    known
}
