//! Sandbox primitives. Every built-in tool routes its side effects through
//! one of these: file access through [`FsSandbox`], subprocesses through
//! [`ShellPolicy`] and [`run_command`], network fetches through [`WebPolicy`].

pub mod fs;
pub mod shell;
pub mod web;

pub use fs::{Access, FsSandbox};
pub use shell::{normalize_command, run_command, CommandOutput, ShellPolicy};
pub use web::{is_blocked_ip, strip_userinfo, FetchedPage, WebPolicy};
