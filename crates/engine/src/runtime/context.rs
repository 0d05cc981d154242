//! System prompt assembly.
//!
//! One prompt per run: an identity block (time, runtime, workspace, tool
//! guidance), the workspace bootstrap files, the configured prompt and the
//! current session. The prompt is built once at the start of a run, so
//! every model call in that run shares the same system text.

use std::path::PathBuf;

use chrono::{DateTime, Local};

use super::InboundMessage;

/// Workspace files injected in this order when present.
pub const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Longest slice of one bootstrap file kept in the prompt.
const MAX_FILE_CHARS: usize = 20_000;

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

const TOOL_GUIDELINES: &str = "\
## Tool Call Guidelines
- Before calling tools, you may briefly state your intent, but never describe a result before receiving it.
- Read a file before modifying it.
- Do not assume a file or directory exists; use list_dir or read_file to check.
- If a tool call fails, read the error before retrying with a different approach.";

/// A bootstrap file read from the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceFile {
    pub name: String,
    pub content: String,
    pub truncated: bool,
}

pub struct ContextBuilder {
    workspace: Option<PathBuf>,
    base_prompt: Option<String>,
}

impl ContextBuilder {
    pub fn new(base_prompt: Option<String>) -> Self {
        Self {
            workspace: None,
            base_prompt,
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Read the bootstrap files. Missing or unreadable files are skipped.
    pub async fn load_files(&self) -> Vec<WorkspaceFile> {
        let Some(dir) = &self.workspace else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for name in BOOTSTRAP_FILES {
            let path = dir.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) if !raw.trim().is_empty() => {
                    let truncated = raw.chars().count() > MAX_FILE_CHARS;
                    let content = if truncated {
                        raw.chars().take(MAX_FILE_CHARS).collect()
                    } else {
                        raw
                    };
                    files.push(WorkspaceFile {
                        name: (*name).to_string(),
                        content,
                        truncated,
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping bootstrap file");
                }
            }
        }
        files
    }

    /// The system prompt for a run handling `msg`.
    pub async fn system_prompt(&self, msg: &InboundMessage) -> String {
        let files = self.load_files().await;
        tracing::debug!(bootstrap_files = files.len(), "system prompt assembled");
        self.render(msg, Local::now(), &files)
    }

    /// Pure assembly from already-loaded parts.
    pub fn render(&self, msg: &InboundMessage, now: DateTime<Local>, files: &[WorkspaceFile]) -> String {
        let mut parts = vec![self.identity(now)];

        if !files.is_empty() {
            let body: Vec<String> = files
                .iter()
                .map(|f| {
                    let marker = if f.truncated { "\n\n[truncated]" } else { "" };
                    format!("## {}\n\n{}{marker}", f.name, f.content.trim_end())
                })
                .collect();
            parts.push(body.join("\n\n"));
        }

        if let Some(prompt) = self.base_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            parts.push(prompt.to_string());
        }

        parts.push(session_block(msg));
        parts.join(SECTION_SEPARATOR)
    }

    fn identity(&self, now: DateTime<Local>) -> String {
        let mut out = format!(
            "# nanoagent\n\n## Current Time\n{} (UTC{})\n\n## Runtime\n{} {}",
            now.format("%Y-%m-%d %H:%M (%A)"),
            now.format("%:z"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        if let Some(dir) = &self.workspace {
            out.push_str(&format!(
                "\n\n## Workspace\nYour workspace is at: {}\n\n\
                 Reply directly with text for conversations. Only use the 'message' tool to send to a specific chat channel.",
                dir.display()
            ));
        }
        out.push_str("\n\n");
        out.push_str(TOOL_GUIDELINES);
        out
    }
}

fn session_block(msg: &InboundMessage) -> String {
    let mut out = format!(
        "## Current Session\nChannel: {}\nChat ID: {}",
        msg.channel, msg.sender_id
    );
    if let Some(thread) = &msg.thread {
        out.push_str(&format!("\nThread: {thread}"));
    }
    out
}
