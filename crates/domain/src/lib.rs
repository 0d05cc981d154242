//! Shared types for the nanoagent workspace: conversation turns, tool
//! contracts, provider stream events, configuration and the error taxonomy.

pub mod capability;
pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, ErrorKind, Result};
