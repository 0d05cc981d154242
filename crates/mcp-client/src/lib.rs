//! `na-mcp-client`: client for MCP (Model Context Protocol) tool servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for talking to tool servers.
//! - A stdio transport that spawns a child process and exchanges one JSON
//!   message per line, and an HTTP transport that POSTs each message and
//!   accepts either a JSON or an SSE response.
//! - An [`McpManager`] that owns every connection, isolates failures per
//!   server and reconnects lazily after a cooldown.
//!
//! # Usage
//!
//! ```rust,ignore
//! use na_mcp_client::McpManager;
//!
//! let manager = McpManager::new(&config.mcp);
//! for server in &config.mcp.servers {
//!     let tools = manager.connect(server).await?;
//!     for tool in tools {
//!         println!("{} -> {}/{}", tool.registered_name, tool.server, tool.def.name);
//!     }
//! }
//! let result = manager.invoke("fs", "read_file", json!({"path": "/tmp/a"})).await?;
//! ```

pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{registered_tool_name, McpError, McpManager, RemoteTool};
pub use protocol::{McpToolDef, ToolCallResult};
pub use transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
