//! `cron` tool: register, list and remove scheduled reminders.
//!
//! Jobs are persisted to `<state>/cron/jobs.json`. Triggering them is the
//! scheduler's job; this tool only manages the registrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::tool::{parse_args, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    Every {
        seconds: u64,
    },
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CronSchedule::Cron { expr, timezone: Some(tz) } => write!(f, "cron '{expr}' ({tz})"),
            CronSchedule::Cron { expr, timezone: None } => write!(f, "cron '{expr}'"),
            CronSchedule::Every { seconds } => write!(f, "every {seconds}s"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub message: String,
    pub schedule: CronSchedule,
    /// Delivery target: the channel and sender that registered the job.
    pub channel: String,
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
    #[serde(default = "d_version")]
    version: u32,
    #[serde(default)]
    jobs: Vec<CronJob>,
}

fn d_version() -> u32 {
    1
}

/// File-backed job list. Writes are serialized through one lock.
pub struct CronStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CronStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("cron").join("jobs.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<JobsFile, ToolError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ToolError::execution(format!("corrupt job file '{}': {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobsFile {
                version: d_version(),
                jobs: Vec::new(),
            }),
            Err(e) => Err(ToolError::execution(format!("failed to read jobs: {e}"))),
        }
    }

    async fn save(&self, file: &JobsFile) -> Result<(), ToolError> {
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| ToolError::execution(format!("failed to encode jobs: {e}")))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::execution(format!("failed to create cron dir: {e}")))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| ToolError::execution(format!("failed to write jobs: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ToolError::execution(format!("failed to write jobs: {e}")))
    }

    pub async fn add(&self, job: CronJob) -> Result<(), ToolError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.jobs.push(job);
        self.save(&file).await
    }

    pub async fn list(&self) -> Result<Vec<CronJob>, ToolError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.jobs)
    }

    /// Returns whether a job was removed.
    pub async fn remove(&self, id: &str) -> Result<bool, ToolError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let before = file.jobs.len();
        file.jobs.retain(|j| j.id != id);
        if file.jobs.len() == before {
            return Ok(false);
        }
        self.save(&file).await?;
        Ok(true)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate an IANA timezone string.
pub fn validate_timezone(tz: &str) -> Result<(), String> {
    if tz.parse::<chrono_tz::Tz>().is_err() {
        Err(format!(
            "invalid timezone: '{tz}'; use IANA names like 'America/New_York' or 'UTC'"
        ))
    } else {
        Ok(())
    }
}

/// Validate a 5-field cron expression.
pub fn validate_cron(cron: &str) -> Result<(), String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "expected 5 fields (minute hour dom month dow), got {}",
            fields.len()
        ));
    }
    let names = ["minute", "hour", "day-of-month", "month", "day-of-week"];
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

    for (i, field) in fields.iter().enumerate() {
        validate_cron_field(field, names[i], ranges[i].0, ranges[i].1)?;
    }
    Ok(())
}

fn validate_cron_field(field: &str, name: &str, min: u32, max: u32) -> Result<(), String> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| format!("{name}: invalid step '*/{step}', expected a number"))?;
        if n == 0 || n > max {
            return Err(format!("{name}: step {n} out of range 1..={max}"));
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| format!("{name}: invalid range start '{start_s}'"))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| format!("{name}: invalid range end '{end_s}'"))?;
            if start < min || start > max || end < min || end > max {
                return Err(format!(
                    "{name}: range {start}-{end} out of bounds {min}..={max}"
                ));
            }
            if start > end {
                return Err(format!("{name}: range start {start} > end {end}"));
            }
        } else {
            let n: u32 = part
                .parse()
                .map_err(|_| format!("{name}: invalid value '{part}'"))?;
            if n < min || n > max {
                return Err(format!("{name}: value {n} out of range {min}..={max}"));
            }
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum CronRequest {
    Add {
        message: String,
        #[serde(default)]
        cron_expr: Option<String>,
        #[serde(default)]
        every_seconds: Option<u64>,
        #[serde(default)]
        timezone: Option<String>,
    },
    List,
    Remove {
        job_id: String,
    },
}

pub struct CronTool {
    store: Arc<CronStore>,
}

impl CronTool {
    pub fn new(store: Arc<CronStore>) -> Self {
        Self { store }
    }

    async fn add(
        &self,
        ctx: &ToolContext,
        message: String,
        schedule: CronSchedule,
    ) -> InvokeResult {
        if message.trim().is_empty() {
            return Err(ToolError::validation("message is required for add"));
        }
        if ctx.channel.is_empty() || ctx.sender_id.is_empty() {
            return Err(ToolError::execution("no session context (channel/chat_id)"));
        }
        let job = CronJob {
            id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            message,
            schedule,
            channel: ctx.channel.clone(),
            chat_id: ctx.sender_id.clone(),
            created_at: Utc::now(),
        };
        self.store.add(job.clone()).await?;
        tracing::info!(job_id = %job.id, channel = %job.channel, schedule = %job.schedule, "cron job registered");

        Ok(ToolOutput::text(format!("Created job '{}' (id: {})", job.message, job.id))
            .with_artifact("cron_job", json!({ "id": job.id, "schedule": job.schedule })))
    }
}

fn build_schedule(
    cron_expr: Option<String>,
    every_seconds: Option<u64>,
    timezone: Option<String>,
) -> Result<CronSchedule, ToolError> {
    match (cron_expr, every_seconds) {
        (Some(expr), None) => {
            validate_cron(&expr).map_err(ToolError::validation)?;
            if let Some(tz) = &timezone {
                validate_timezone(tz).map_err(ToolError::validation)?;
            }
            Ok(CronSchedule::Cron { expr, timezone })
        }
        (None, Some(seconds)) => {
            if timezone.is_some() {
                return Err(ToolError::validation("timezone can only be used with cron_expr"));
            }
            if seconds == 0 {
                return Err(ToolError::validation("every_seconds must be at least 1"));
            }
            Ok(CronSchedule::Every { seconds })
        }
        (Some(_), Some(_)) => Err(ToolError::validation(
            "give either cron_expr or every_seconds, not both",
        )),
        (None, None) => Err(ToolError::validation("either every_seconds or cron_expr is required")),
    }
}

#[async_trait::async_trait]
impl ToolInvoker for CronTool {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> InvokeResult {
        match parse_args::<CronRequest>(args)? {
            CronRequest::Add {
                message,
                cron_expr,
                every_seconds,
                timezone,
            } => {
                let schedule = build_schedule(cron_expr, every_seconds, timezone)?;
                self.add(ctx, message, schedule).await
            }
            CronRequest::List => {
                let jobs = self.store.list().await?;
                if jobs.is_empty() {
                    return Ok(ToolOutput::text("No scheduled jobs."));
                }
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| format!("- {} (id: {}, {})", j.message, j.id, j.schedule))
                    .collect();
                Ok(ToolOutput::text(format!("Scheduled jobs:\n{}", lines.join("\n"))))
            }
            CronRequest::Remove { job_id } => {
                if self.store.remove(&job_id).await? {
                    Ok(ToolOutput::text(format!("Removed job {job_id}")))
                } else {
                    Err(ToolError::execution(format!("Job {job_id} not found")))
                }
            }
        }
    }
}

impl BuiltinTool for CronTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "cron".into(),
            description: "Schedule reminders and recurring tasks. Actions: add, list, remove.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["add", "list", "remove"] },
                    "message": { "type": "string", "description": "Reminder text (for add)" },
                    "every_seconds": { "type": "integer", "minimum": 1, "description": "Interval in seconds" },
                    "cron_expr": { "type": "string", "description": "5-field cron expression like '0 9 * * *'" },
                    "timezone": { "type": "string", "description": "IANA timezone for cron_expr" },
                    "job_id": { "type": "string", "description": "Job id (for remove)" }
                },
                "required": ["action"]
            }),
        }
    }
}
