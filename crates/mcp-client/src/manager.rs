//! McpManager: owns every tool-server connection, performs discovery and
//! forwards calls.
//!
//! Each server lives in its own [`ServerSlot`]. A transport failure marks
//! only that slot down; other servers and built-in tools are untouched.
//! A down server is retried lazily on the first call after the reconnect
//! cooldown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::time::Instant;

use na_domain::config::{McpConfig, McpServerConfig, McpTransportKind};
use na_domain::error::ToolError;
use na_domain::trace::TraceEvent;

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

/// Upper bound on `tools/list` pages fetched from one server.
const MAX_LIST_PAGES: usize = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Discovered tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool declared by a server, ready to be merged into the registry.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub server: String,
    /// Namespaced name the model sees (`mcp_<server>_<tool>`).
    pub registered_name: String,
    /// The declaration as returned by the server; `def.name` is what gets
    /// sent back in `tools/call`.
    pub def: McpToolDef,
}

/// `mcp_<server>_<tool>`, with characters outside `[A-Za-z0-9_-]` replaced
/// by `_` so the name is accepted by every provider's tool-name rules.
pub fn registered_tool_name(server: &str, tool: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect()
    };
    format!("mcp_{}_{}", sanitize(server), sanitize(tool))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server slots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SlotState {
    Up(Arc<dyn McpTransport>),
    Down { since: Instant, reason: String },
}

struct ServerSlot {
    config: McpServerConfig,
    timeout: Duration,
    state: Mutex<SlotState>,
    /// Held while reconnecting so concurrent callers don't spawn twice.
    reconnect: tokio::sync::Mutex<()>,
}

enum Ready {
    Up(Arc<dyn McpTransport>),
    Down(String),
    Retry,
}

impl ServerSlot {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn check(&self, cooldown: Duration) -> Ready {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Up(t) if t.is_alive() => return Ready::Up(t.clone()),
            SlotState::Up(_) => {}
            SlotState::Down { since, reason } => {
                return if since.elapsed() >= cooldown {
                    Ready::Retry
                } else {
                    Ready::Down(reason.clone())
                };
            }
        }

        // The transport died on its own (e.g. the process exited).
        let reason = "transport closed".to_string();
        emit_down(self.name(), &reason);
        *state = SlotState::Down {
            since: Instant::now(),
            reason: reason.clone(),
        };
        if cooldown.is_zero() {
            Ready::Retry
        } else {
            Ready::Down(reason)
        }
    }

    /// Marks the slot down and hands back the transport that was live, if any.
    fn mark_down(&self, reason: &str) -> Option<Arc<dyn McpTransport>> {
        let previous = std::mem::replace(
            &mut *self.state.lock(),
            SlotState::Down {
                since: Instant::now(),
                reason: reason.to_string(),
            },
        );
        emit_down(self.name(), reason);
        match previous {
            SlotState::Up(t) => Some(t),
            SlotState::Down { .. } => None,
        }
    }
}

fn emit_down(server: &str, reason: &str) {
    tracing::warn!(server = %server, reason = %reason, "tool server marked down");
    TraceEvent::ToolServerDown {
        server: server.to_string(),
        reason: reason.to_string(),
    }
    .emit();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared across sessions; every method takes `&self`.
pub struct McpManager {
    allowed_commands: Vec<String>,
    call_timeout: Duration,
    cooldown: Duration,
    servers: RwLock<HashMap<String, Arc<ServerSlot>>>,
}

impl McpManager {
    pub fn new(config: &McpConfig) -> Self {
        Self {
            allowed_commands: config.allowed_commands.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            cooldown: Duration::from_secs(config.reconnect_cooldown_secs),
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Start (or connect to) a server, run the handshake and fetch its tool
    /// schemas. The schemas are fetched once; reconnects reuse them.
    pub async fn connect(&self, config: &McpServerConfig) -> Result<Vec<RemoteTool>, McpError> {
        self.check_declaration(config)?;
        if self.servers.read().contains_key(&config.name) {
            return Err(McpError::Config(format!(
                "tool server '{}' is already connected",
                config.name
            )));
        }

        let timeout = self.server_timeout(config);
        tracing::info!(
            server = %config.name,
            transport = config.transport.as_str(),
            "connecting tool server"
        );
        let (transport, defs) = open(config, timeout).await?;

        let slot = Arc::new(ServerSlot {
            config: config.clone(),
            timeout,
            state: Mutex::new(SlotState::Up(transport.clone())),
            reconnect: tokio::sync::Mutex::new(()),
        });
        let inserted = {
            let mut servers = self.servers.write();
            if servers.contains_key(&config.name) {
                false
            } else {
                servers.insert(config.name.clone(), slot);
                true
            }
        };
        if !inserted {
            transport.shutdown().await;
            return Err(McpError::Config(format!(
                "tool server '{}' is already connected",
                config.name
            )));
        }

        TraceEvent::ToolServerConnected {
            server: config.name.clone(),
            transport: config.transport.as_str(),
            tools: defs.len(),
        }
        .emit();

        Ok(defs
            .into_iter()
            .map(|def| RemoteTool {
                server: config.name.clone(),
                registered_name: registered_tool_name(&config.name, &def.name),
                def,
            })
            .collect())
    }

    /// Call `tool` on `server`. Failures stay inside this server's slot.
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let slot = self
            .servers
            .read()
            .get(server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))?;

        let transport = self.ready_transport(&slot).await?;

        let resp = match transport
            .send_request("tools/call", Some(protocol::call_params(tool, arguments)), slot.timeout)
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_fatal() => {
                let reason = e.to_string();
                if let Some(t) = slot.mark_down(&reason) {
                    t.shutdown().await;
                }
                return Err(McpError::ServerDown {
                    server: server.to_string(),
                    reason,
                });
            }
            Err(e) => return Err(McpError::Transport(e)),
        };

        let value = resp
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/call failed: {e}")))?;
        let result: ToolCallResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))?;
        if result.is_error {
            return Err(McpError::ToolFailed(result.text()));
        }
        Ok(result)
    }

    /// Stop a server and forget it. Returns `false` if it was unknown.
    pub async fn disconnect(&self, server: &str) -> bool {
        let Some(slot) = self.servers.write().remove(server) else {
            return false;
        };
        let transport = match std::mem::replace(
            &mut *slot.state.lock(),
            SlotState::Down {
                since: Instant::now(),
                reason: "disconnected".into(),
            },
        ) {
            SlotState::Up(t) => Some(t),
            SlotState::Down { .. } => None,
        };
        if let Some(t) = transport {
            t.shutdown().await;
        }
        tracing::info!(server = %server, "tool server disconnected");
        true
    }

    /// Close every transport concurrently.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.read().keys().cloned().collect();
        let futs: Vec<_> = names.iter().map(|n| self.disconnect(n)).collect();
        futures_util::future::join_all(futs).await;
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_up(&self, server: &str) -> bool {
        self.servers
            .read()
            .get(server)
            .is_some_and(|slot| matches!(&*slot.state.lock(), SlotState::Up(t) if t.is_alive()))
    }

    /// Per-call timeout for the server's tools.
    pub fn tool_timeout(&self, server: &str) -> Duration {
        self.servers
            .read()
            .get(server)
            .map(|slot| slot.timeout)
            .unwrap_or(self.call_timeout)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn server_timeout(&self, config: &McpServerConfig) -> Duration {
        config
            .tool_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.call_timeout)
    }

    fn check_declaration(&self, config: &McpServerConfig) -> Result<(), McpError> {
        if config.name.trim().is_empty() {
            return Err(McpError::Config("tool server name is empty".into()));
        }
        match config.transport {
            McpTransportKind::Stdio => {
                if config.command.trim().is_empty() {
                    return Err(McpError::Config(format!(
                        "tool server '{}' has no command",
                        config.name
                    )));
                }
                let program = Path::new(&config.command)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(&config.command);
                if !self.allowed_commands.iter().any(|c| c == program) {
                    return Err(McpError::CommandNotAllowed(config.command.clone()));
                }
            }
            McpTransportKind::Http => {
                if !config.url.as_deref().is_some_and(|u| !u.trim().is_empty()) {
                    return Err(McpError::Config(format!(
                        "tool server '{}' has no url",
                        config.name
                    )));
                }
            }
        }
        Ok(())
    }

    async fn ready_transport(&self, slot: &ServerSlot) -> Result<Arc<dyn McpTransport>, McpError> {
        let down = |reason: String| McpError::ServerDown {
            server: slot.name().to_string(),
            reason,
        };

        match slot.check(self.cooldown) {
            Ready::Up(t) => return Ok(t),
            Ready::Down(reason) => return Err(down(reason)),
            Ready::Retry => {}
        }

        let _guard = slot.reconnect.lock().await;
        // Another caller may have reconnected while we waited.
        match slot.check(self.cooldown) {
            Ready::Up(t) => return Ok(t),
            Ready::Down(reason) => return Err(down(reason)),
            Ready::Retry => {}
        }

        tracing::info!(server = %slot.name(), "reconnecting tool server");
        match open(&slot.config, slot.timeout).await {
            Ok((transport, defs)) => {
                *slot.state.lock() = SlotState::Up(transport.clone());
                TraceEvent::ToolServerConnected {
                    server: slot.name().to_string(),
                    transport: slot.config.transport.as_str(),
                    tools: defs.len(),
                }
                .emit();
                Ok(transport)
            }
            Err(e) => {
                let reason = format!("reconnect failed: {e}");
                slot.mark_down(&reason);
                Err(down(reason))
            }
        }
    }
}

/// Create the transport and run the handshake. A transport whose handshake
/// fails is shut down before returning.
async fn open(
    config: &McpServerConfig,
    timeout: Duration,
) -> Result<(Arc<dyn McpTransport>, Vec<McpToolDef>), McpError> {
    let transport: Arc<dyn McpTransport> = match config.transport {
        McpTransportKind::Stdio => Arc::new(StdioTransport::spawn(config)?),
        McpTransportKind::Http => Arc::new(HttpTransport::new(config)?),
    };
    match handshake(transport.as_ref(), timeout).await {
        Ok(defs) => Ok((transport, defs)),
        Err(e) => {
            transport.shutdown().await;
            Err(e)
        }
    }
}

async fn handshake(transport: &dyn McpTransport, timeout: Duration) -> Result<Vec<McpToolDef>, McpError> {
    transport
        .send_request("initialize", Some(protocol::initialize_params()), timeout)
        .await?
        .into_result()
        .map_err(|e| McpError::Protocol(format!("initialize failed: {e}")))?;
    transport.send_notification("notifications/initialized").await?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let value = transport
            .send_request("tools/list", params, timeout)
            .await?
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/list failed: {e}")))?;
        let page: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/list result: {e}")))?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(tools)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("tool server transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("tool server protocol error: {0}")]
    Protocol(String),

    #[error("unknown tool server: {0}")]
    ServerNotFound(String),

    #[error("tool server '{server}' is unavailable: {reason}")]
    ServerDown { server: String, reason: String },

    #[error("command not in allowed_commands: {0}")]
    CommandNotAllowed(String),

    #[error("invalid tool server declaration: {0}")]
    Config(String),

    #[error("{0}")]
    ToolFailed(String),
}

impl From<McpError> for ToolError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Transport(TransportError::Timeout) => {
                ToolError::timeout("tool server did not answer in time")
            }
            McpError::Protocol(_) | McpError::ToolFailed(_) => ToolError::execution(e.to_string()),
            other => ToolError::unavailable(other.to_string()),
        }
    }
}

impl From<McpError> for na_domain::Error {
    fn from(e: McpError) -> Self {
        na_domain::Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_domain::ErrorKind;

    fn stdio(name: &str, command: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            transport: McpTransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            tool_timeout_secs: None,
        }
    }

    #[test]
    fn registered_names_are_namespaced_and_sanitized() {
        assert_eq!(registered_tool_name("fs", "read_file"), "mcp_fs_read_file");
        assert_eq!(registered_tool_name("my.server", "a b/c"), "mcp_my_server_a_b_c");
    }

    #[test]
    fn commands_are_matched_on_file_name() {
        let manager = McpManager::new(&McpConfig::default());
        assert!(manager.check_declaration(&stdio("a", "/usr/local/bin/npx")).is_ok());
        assert!(matches!(
            manager.check_declaration(&stdio("a", "/bin/bash")),
            Err(McpError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            manager.check_declaration(&stdio("a", "")),
            Err(McpError::Config(_))
        ));
    }

    #[test]
    fn http_declaration_needs_url() {
        let manager = McpManager::new(&McpConfig::default());
        let mut cfg = stdio("remote", "");
        cfg.transport = McpTransportKind::Http;
        assert!(matches!(manager.check_declaration(&cfg), Err(McpError::Config(_))));
        cfg.url = Some("https://tools.example.com/mcp".into());
        assert!(manager.check_declaration(&cfg).is_ok());
    }

    #[test]
    fn per_server_timeout_overrides_default() {
        let manager = McpManager::new(&McpConfig::default());
        let mut cfg = stdio("a", "npx");
        assert_eq!(manager.server_timeout(&cfg), Duration::from_secs(30));
        cfg.tool_timeout_secs = Some(5);
        assert_eq!(manager.server_timeout(&cfg), Duration::from_secs(5));
        assert_eq!(manager.tool_timeout("unknown"), Duration::from_secs(30));
    }

    #[test]
    fn errors_map_onto_tool_error_kinds() {
        let kind = |e: McpError| ToolError::from(e).kind;
        assert_eq!(kind(McpError::Transport(TransportError::Timeout)), ErrorKind::ToolTimeout);
        assert_eq!(kind(McpError::ToolFailed("boom".into())), ErrorKind::ToolExecution);
        assert_eq!(
            kind(McpError::ServerDown { server: "a".into(), reason: "exited".into() }),
            ErrorKind::ToolServerUnavailable
        );
        assert_eq!(kind(McpError::ServerNotFound("a".into())), ErrorKind::ToolServerUnavailable);
    }

    #[tokio::test]
    async fn invoking_unknown_server_is_not_found() {
        let manager = McpManager::new(&McpConfig::default());
        let err = manager.invoke("ghost", "x", Value::Null).await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotFound(_)));
        assert!(!manager.disconnect("ghost").await);
    }
}
