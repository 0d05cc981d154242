//! `exec` tool: run a shell command under [`ShellPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use na_domain::tool::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sandbox::{run_command, ShellPolicy};
use crate::tool::{parse_args, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput};

/// Extra dispatcher budget on top of the command timeout, so the tool's
/// own kill-and-reap path runs before the outer deadline.
const DISPATCH_GRACE: Duration = Duration::from_secs(7);

#[derive(Debug, Clone, Deserialize)]
struct ExecRequest {
    command: String,
    /// Working directory, relative to the workspace.
    #[serde(default)]
    working_dir: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    env: HashMap<String, String>,
}

pub struct ExecTool {
    policy: Arc<ShellPolicy>,
    timeout: Duration,
    max_output_chars: usize,
}

impl ExecTool {
    pub fn new(policy: Arc<ShellPolicy>, timeout: Duration, max_output_chars: usize) -> Self {
        Self {
            policy,
            timeout,
            max_output_chars,
        }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for ExecTool {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: ExecRequest = parse_args(args)?;
        let cwd = self.policy.resolve_cwd(req.working_dir.as_deref())?;
        self.policy.check_env(&req.env)?;
        self.policy.check(&req.command, &cwd)?;

        let started = Instant::now();
        let output = run_command(&req.command, &cwd, &req.env, self.timeout).await?;
        tracing::debug!(
            session_key = %ctx.session_key,
            call_id = %ctx.call_id,
            exit_code = ?output.exit_code,
            duration_ms = started.elapsed().as_millis() as u64,
            "exec finished"
        );

        Ok(ToolOutput::text(output.render(self.max_output_chars)))
    }
}

impl BuiltinTool for ExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exec".into(),
            description: "Execute a shell command and return its output. Use with caution.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The shell command to execute" },
                    "working_dir": { "type": "string", "description": "Optional working directory, relative to the workspace" },
                    "env": {
                        "type": "object",
                        "description": "Extra environment variables",
                        "additionalProperties": { "type": "string" }
                    }
                },
                "required": ["command"]
            }),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout + DISPATCH_GRACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_domain::config::ExecConfig;
    use na_domain::ErrorKind;
    use tempfile::TempDir;

    fn tool(dir: &TempDir, timeout: Duration) -> ExecTool {
        let policy = ShellPolicy::from_config(&ExecConfig::default(), true, dir.path()).unwrap();
        ExecTool::new(Arc::new(policy), timeout, 10_000)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_inside_the_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let out = tool(&dir, Duration::from_secs(10))
            .invoke(&ToolContext::default(), json!({"command": "cat marker.txt"}))
            .await
            .unwrap();
        assert_eq!(out.payload, json!("here"));
    }

    #[tokio::test]
    async fn encoded_destructive_command_never_runs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();
        let err = tool(&dir, Duration::from_secs(10))
            .invoke(
                &ToolContext::default(),
                json!({"command": "%72%6d -rf keep.txt"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxViolation);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = TempDir::new().unwrap();
        let err = tool(&dir, Duration::from_millis(300))
            .invoke(&ToolContext::default(), json!({"command": "sleep 20"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolTimeout);
    }

    #[test]
    fn dispatch_budget_exceeds_command_timeout() {
        let dir = TempDir::new().unwrap();
        let t = tool(&dir, Duration::from_secs(60));
        assert!(BuiltinTool::timeout(&t) > Duration::from_secs(60));
    }
}
