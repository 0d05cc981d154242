//! Shell confinement: command screening, working-directory checks and
//! process-group execution.

use na_domain::config::ExecConfig;
use na_domain::error::ToolError;
use na_domain::Error;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Grace period for reaping a killed process group.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct ShellPolicy {
    deny: Vec<Regex>,
    allow: Vec<Regex>,
    restrict_to_workspace: bool,
    workspace: PathBuf,
}

impl ShellPolicy {
    pub fn from_config(
        cfg: &ExecConfig,
        restrict_to_workspace: bool,
        workspace: impl Into<PathBuf>,
    ) -> na_domain::Result<Self> {
        Ok(Self {
            deny: compile_patterns(&cfg.deny_patterns, "deny")?,
            allow: compile_patterns(&cfg.allow_patterns, "allow")?,
            restrict_to_workspace,
            workspace: workspace.into(),
        })
    }

    pub fn restrict_to_workspace(&self) -> bool {
        self.restrict_to_workspace
    }

    /// Screen a command before it runs. `cwd` is the already-resolved
    /// working directory.
    pub fn check(&self, command: &str, cwd: &Path) -> Result<(), ToolError> {
        let raw = command.trim();
        if raw.is_empty() {
            return Err(ToolError::validation("command must not be empty"));
        }
        let decoded = decode_command(raw);
        let normalized = decoded.to_lowercase();
        let forms = [raw, normalized.as_str()];

        if self
            .deny
            .iter()
            .any(|re| forms.iter().any(|f| re.is_match(f)))
        {
            return Err(ToolError::sandbox(
                "Command blocked by safety guard (dangerous pattern detected)",
            ));
        }

        if !self.allow.is_empty()
            && !self
                .allow
                .iter()
                .any(|re| forms.iter().any(|f| re.is_match(f)))
        {
            return Err(ToolError::sandbox(
                "Command blocked by safety guard (not in allowlist)",
            ));
        }

        if self.restrict_to_workspace {
            // Paths are case-sensitive, so these use the decoded form as-is.
            for form in [raw, decoded.as_str()] {
                if form.contains("../") || form.contains("..\\") {
                    return Err(ToolError::sandbox(
                        "Command blocked by safety guard (path traversal detected)",
                    ));
                }
                for path in absolute_paths(form) {
                    if !path_within(&path, cwd) {
                        return Err(ToolError::sandbox(format!(
                            "Command blocked by safety guard (path '{}' outside working dir)",
                            path.display()
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve the working directory for a command. Relative paths are
    /// taken from the workspace root.
    pub fn resolve_cwd(&self, requested: Option<&str>) -> Result<PathBuf, ToolError> {
        let workspace = self.workspace.canonicalize().map_err(|e| {
            ToolError::execution(format!(
                "cannot resolve workspace '{}': {e}",
                self.workspace.display()
            ))
        })?;
        let Some(requested) = requested.filter(|s| !s.trim().is_empty()) else {
            return Ok(workspace);
        };

        let cwd = workspace.join(requested).canonicalize().map_err(|e| {
            ToolError::execution(format!("cannot resolve working_dir '{requested}': {e}"))
        })?;
        if !cwd.is_dir() {
            return Err(ToolError::execution(format!(
                "working_dir '{requested}' is not a directory"
            )));
        }
        if self.restrict_to_workspace && !cwd.starts_with(&workspace) {
            return Err(ToolError::sandbox(format!(
                "working_dir '{requested}' is outside the workspace"
            )));
        }
        Ok(cwd)
    }

    /// Reject environment overrides that would change how the shell or
    /// the dynamic loader behaves.
    pub fn check_env(&self, env: &HashMap<String, String>) -> Result<(), ToolError> {
        for key in env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(ToolError::validation(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
            if is_dangerous_env_var(key) {
                return Err(ToolError::sandbox(format!(
                    "environment variable '{key}' is blocked by security policy"
                )));
            }
        }
        Ok(())
    }
}

fn compile_patterns(patterns: &[String], which: &str) -> na_domain::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| Error::Config(format!("tools.exec.{which}_patterns: '{p}': {e}")))
        })
        .collect()
}

fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
        "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH",
        "PATH", "HOME", "USER", "SHELL",
        "SSH_AUTH_SOCK", "SSH_AGENT_PID",
        "PYTHONPATH", "PYTHONSTARTUP", "PYTHONHOME",
        "NODE_PATH", "NODE_OPTIONS",
        "RUBYLIB", "RUBYOPT",
        "PERL5LIB", "PERL5OPT",
        "CLASSPATH",
        "BASH_ENV", "ENV", "CDPATH",
        "IFS", "PS4", "PROMPT_COMMAND",
    ];
    let upper = name.to_ascii_uppercase();
    BLOCKED.contains(&upper.as_str()) || upper.starts_with("DYLD_") || upper.starts_with("LD_")
}

fn absolute_paths(command: &str) -> Vec<PathBuf> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = RE
        .get_or_init(|| Regex::new(r#"(?:^|[\s|>=])(/[^\s"'>;|&]+)"#).ok())
        .as_ref()
    else {
        return Vec::new();
    };
    re.captures_iter(command)
        .filter_map(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str()))
        .collect()
}

fn path_within(path: &Path, cwd: &Path) -> bool {
    if path == Path::new("/dev/null") {
        return true;
    }
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    resolved.starts_with(cwd)
}

// ── Normalization ───────────────────────────────────────────────────

/// Decode a command the way a shell or URL layer would before it runs:
/// percent-decoding repeated until stable, then ANSI-C `$'...'` escapes,
/// then lower-casing.
pub fn normalize_command(command: &str) -> String {
    decode_command(command).to_lowercase()
}

fn decode_command(command: &str) -> String {
    let mut current = command.to_string();
    for _ in 0..8 {
        let decoded = percent_decode(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    expand_ansi_c_quotes(&current)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(h), Some(l)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(h * 16 + l);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn expand_ansi_c_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("$'") {
        out.push_str(&rest[..start]);
        let body_start = start + 2;
        match closing_quote(&rest[body_start..]) {
            Some(len) => {
                out.push_str(&unescape_ansi_c(&rest[body_start..body_start + len]));
                rest = &rest[body_start + len + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte offset of the unescaped closing `'`.
fn closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn unescape_ansi_c(body: &str) -> String {
    let bytes = body.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = bytes[i + 1];
        i += 2;
        match esc {
            b'x' => {
                let mut value: u8 = 0;
                let mut digits = 0;
                while digits < 2 && i < bytes.len() {
                    match hex_val(bytes[i]) {
                        Some(v) => {
                            value = value.wrapping_mul(16).wrapping_add(v);
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.extend_from_slice(b"\\x");
                } else {
                    out.push(value);
                }
            }
            b'0'..=b'7' => {
                let mut value: u32 = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Text handed back to the model, truncated to `max_chars`.
    pub fn render(&self, max_chars: usize) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(self.stdout.clone());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", self.stderr));
        }
        match self.exit_code {
            Some(0) => {}
            Some(code) => parts.push(format!("\nExit code: {code}")),
            None => parts.push("\nExit code: terminated by signal".to_string()),
        }

        let text = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };

        let total = text.chars().count();
        if total <= max_chars {
            return text;
        }
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push_str(&format!("\n... (truncated, {} more chars)", total - max_chars));
        truncated
    }
}

/// Kills an entire process group when dropped.
///
/// The child is spawned as the leader of its own group, so the group id is
/// the leader's pid.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()).filter(|p| *p > 0),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            #[cfg(unix)]
            // SAFETY: killpg has no memory-safety preconditions. A stale
            // group id yields ESRCH, which is ignored.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = pgid;
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// Run `sh -c command` in its own process group.
///
/// On timeout, or if the returned future is dropped, the whole group is
/// sent SIGKILL. After a timeout the leader is reaped before returning.
pub async fn run_command(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<CommandOutput, ToolError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::execution(format!("failed to spawn: {e}")))?;
    let mut guard = ProcessGroupGuard::new(child.id());

    let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            guard.kill();
            return Err(ToolError::execution(format!("failed to wait for command: {e}")));
        }
        Err(_) => {
            guard.kill();
            if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
                tracing::warn!(command = %command, "process group did not exit after SIGKILL");
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(ToolError::timeout(format!(
                "Command timed out after {} seconds",
                timeout.as_secs_f64()
            )));
        }
    };

    // Background jobs left behind by the leader still hold the pipes open.
    guard.kill();

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
    })
}
