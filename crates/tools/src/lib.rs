//! Built-in tools and the sandbox primitives they run under.
//!
//! - `sandbox`: filesystem, shell and network confinement
//! - file tools (`read_file`, `write_file`, `edit_file`, `list_dir`)
//! - `exec`, `web_fetch`, `web_search`, `cron`, `message`

pub mod builtins;
pub mod cron;
pub mod exec;
pub mod file_ops;
pub mod message;
pub mod sandbox;
pub mod tool;
pub mod web;

pub use builtins::{builtin_tools, fs_root};
pub use message::{ChannelSink, OutboundMessage, OutboundSink};
pub use tool::{Builtin, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput, ToolSpec};
