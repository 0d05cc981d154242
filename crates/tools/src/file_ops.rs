//! File tools: read, write, edit and list, all confined by [`FsSandbox`].

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::sandbox::{Access, FsSandbox};
use crate::tool::{parse_args, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
struct ReadFileRequest {
    path: String,
    /// Line number to start from (0-indexed).
    #[serde(default)]
    offset: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EditFileRequest {
    path: String,
    old_text: String,
    new_text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListDirRequest {
    #[serde(default = "default_dot")]
    path: String,
}

fn default_dot() -> String {
    ".".into()
}

#[derive(Debug, Clone, Serialize)]
struct DirEntry {
    name: String,
    size: u64,
    modified: String,
    is_dir: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReadFileTool {
    fs: Arc<FsSandbox>,
}

impl ReadFileTool {
    pub fn new(fs: Arc<FsSandbox>) -> Self {
        Self { fs }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for ReadFileTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: ReadFileRequest = parse_args(args)?;
        let path = self.fs.resolve(&req.path, Access::Existing)?;
        if path.is_dir() {
            return Err(ToolError::execution(format!("'{}' is a directory", req.path)));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::execution(format!("failed to read '{}': {e}", req.path)))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let offset = req.offset.unwrap_or(0);
        let limit = req.limit.unwrap_or(total_lines.saturating_sub(offset));
        let selected: Vec<&str> = lines.into_iter().skip(offset).take(limit).collect();

        Ok(ToolOutput::json(json!({
            "path": req.path,
            "content": selected.join("\n"),
            "total_lines": total_lines,
            "offset": offset,
            "lines_returned": selected.len(),
        })))
    }
}

impl BuiltinTool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read a text file from the workspace. Supports line offset and limit."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path, relative to the workspace" },
                    "offset": { "type": "integer", "minimum": 0, "description": "First line to return (0-indexed)" },
                    "limit": { "type": "integer", "minimum": 1, "description": "Maximum number of lines" }
                },
                "required": ["path"]
            }),
        }
    }
}

pub struct WriteFileTool {
    fs: Arc<FsSandbox>,
}

impl WriteFileTool {
    pub fn new(fs: Arc<FsSandbox>) -> Self {
        Self { fs }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for WriteFileTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: WriteFileRequest = parse_args(args)?;
        let path = self.fs.resolve(&req.path, Access::Create)?;
        if path.is_dir() {
            return Err(ToolError::execution(format!("'{}' is a directory", req.path)));
        }
        atomic_write(&path, req.content.as_bytes()).await?;

        let bytes_written = req.content.len();
        Ok(ToolOutput::json(json!({
            "path": req.path,
            "bytes_written": bytes_written,
            "success": true,
        }))
        .with_artifact(
            "file_written",
            json!({ "path": path.display().to_string(), "bytes": bytes_written }),
        ))
    }
}

impl BuiltinTool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            description: "Create or overwrite a file in the workspace. Parent directories are created as needed.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path, relative to the workspace" },
                    "content": { "type": "string", "description": "Full file contents" }
                },
                "required": ["path", "content"]
            }),
        }
    }
}

pub struct EditFileTool {
    fs: Arc<FsSandbox>,
}

impl EditFileTool {
    pub fn new(fs: Arc<FsSandbox>) -> Self {
        Self { fs }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for EditFileTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: EditFileRequest = parse_args(args)?;
        if req.old_text.is_empty() {
            return Err(ToolError::validation("old_text must not be empty"));
        }
        let path = self.fs.resolve(&req.path, Access::Existing)?;
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::execution(format!("failed to read '{}': {e}", req.path)))?;

        match content.matches(req.old_text.as_str()).count() {
            0 => {
                return Err(ToolError::execution(
                    "old_text not found in file. Make sure it matches exactly.",
                ))
            }
            1 => {}
            n => {
                return Err(ToolError::execution(format!(
                    "old_text appears {n} times. Please provide more context to make it unique."
                )))
            }
        }

        let updated = content.replacen(req.old_text.as_str(), &req.new_text, 1);
        atomic_write(&path, updated.as_bytes()).await?;

        Ok(ToolOutput::json(json!({
            "path": req.path,
            "replacements": 1,
            "success": true,
        }))
        .with_artifact("file_written", json!({ "path": path.display().to_string(), "bytes": updated.len() })))
    }
}

impl BuiltinTool for EditFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "edit_file".into(),
            description: "Replace one exact occurrence of old_text with new_text in a file.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_text": { "type": "string", "description": "Exact text to find; must occur once" },
                    "new_text": { "type": "string" }
                },
                "required": ["path", "old_text", "new_text"]
            }),
        }
    }
}

pub struct ListDirTool {
    fs: Arc<FsSandbox>,
}

impl ListDirTool {
    pub fn new(fs: Arc<FsSandbox>) -> Self {
        Self { fs }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for ListDirTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: ListDirRequest = parse_args(args)?;
        let path = self.fs.resolve(&req.path, Access::Existing)?;
        if !path.is_dir() {
            return Err(ToolError::execution(format!("'{}' is not a directory", req.path)));
        }

        let mut read_dir = fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::execution(format!("failed to read directory '{}': {e}", req.path)))?;

        let mut entries: Vec<DirEntry> = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| ToolError::execution(format!("failed to read directory entry: {e}")))?
        {
            // Entries are listed, not followed, so symlink metadata is enough.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = metadata
                .modified()
                .ok()
                .map(|t| {
                    let dt: DateTime<Utc> = t.into();
                    dt.to_rfc3339()
                })
                .unwrap_or_default();

            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
                modified,
                is_dir: metadata.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ToolOutput::json(json!({
            "path": req.path,
            "count": entries.len(),
            "entries": entries,
        })))
    }
}

impl BuiltinTool for ListDirTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_dir".into(),
            description: "List the entries of a workspace directory.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory path, defaults to the workspace root" }
                }
            }),
        }
    }
}

/// Write to a uniquely-named sibling, sync, then rename into place.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::execution(format!("failed to create parent directory: {e}")))?;
    }

    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().as_simple()
    );
    let tmp_path = path.with_file_name(tmp_name);

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(ToolError::execution(format!(
            "failed to write '{}': {e}",
            path.display()
        )));
    }
    Ok(())
}
