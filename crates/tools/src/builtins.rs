//! Construction of the full built-in tool set from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use na_domain::config::{expand_home, ToolsConfig};

use crate::cron::{CronStore, CronTool};
use crate::exec::ExecTool;
use crate::file_ops::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::message::{MessageTool, OutboundSink};
use crate::sandbox::{FsSandbox, ShellPolicy, WebPolicy};
use crate::tool::Builtin;
use crate::web::{WebFetchTool, WebSearchTool};

/// Root the file tools are confined to: `tools.allowed_root` if set,
/// the workspace otherwise.
pub fn fs_root(cfg: &ToolsConfig, workspace: &Path) -> PathBuf {
    cfg.allowed_root
        .as_deref()
        .map(expand_home)
        .unwrap_or_else(|| workspace.to_path_buf())
}

/// Build every built-in tool. `message` is only included when an outbound
/// sink is available.
pub fn builtin_tools(
    cfg: &ToolsConfig,
    workspace: &Path,
    state_dir: &Path,
    outbound: Option<Arc<dyn OutboundSink>>,
) -> na_domain::Result<Vec<Builtin>> {
    let fs = Arc::new(FsSandbox::new(fs_root(cfg, workspace)));
    let shell = Arc::new(ShellPolicy::from_config(
        &cfg.exec,
        cfg.restrict_to_workspace,
        workspace,
    )?);
    let web = Arc::new(WebPolicy::from_config(&cfg.web));

    let mut tools = vec![
        Builtin::new(ReadFileTool::new(fs.clone())),
        Builtin::new(WriteFileTool::new(fs.clone())),
        Builtin::new(EditFileTool::new(fs.clone())),
        Builtin::new(ListDirTool::new(fs)),
        Builtin::new(ExecTool::new(
            shell,
            Duration::from_secs(cfg.exec.timeout_secs),
            cfg.exec.max_output_chars,
        )),
        Builtin::new(WebSearchTool::from_config(&cfg.web)?),
        Builtin::new(WebFetchTool::new(web, cfg.web.max_chars)),
        Builtin::new(CronTool::new(Arc::new(CronStore::new(state_dir)))),
    ];
    if let Some(sink) = outbound {
        tools.push(Builtin::new(MessageTool::new(sink)));
    }

    tracing::debug!(count = tools.len(), "built-in tools constructed");
    Ok(tools)
}
