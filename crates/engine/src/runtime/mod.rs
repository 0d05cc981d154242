//! Agent runtime: inbound/outbound contracts, the per-message agent loop
//! and the tool registry it dispatches through.
//!
//! Entry point: [`handle_inbound`] takes the session's run lock, then a
//! worker-pool permit, then drives [`turn::run_loop`] to completion.

pub mod context;
pub mod mcp;
pub mod schema;
pub mod tools;
pub mod turn;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use na_domain::error::{Error, ErrorKind, Result};
use na_domain::tool::ToolArtifact;
use na_sessions::session_key;

use crate::state::EngineContext;

pub use turn::run_loop;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound / outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message from a channel adapter (or a cron trigger).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub text: String,
    /// Thread within the channel; separate threads get separate sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    pub fn new(channel: impl Into<String>, sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn session_key(&self) -> String {
        session_key(&self.channel, &self.sender_id, self.thread.as_deref())
    }
}

/// A file the adapter already stored somewhere the tools can reach.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Path or URL.
    pub location: String,
}

/// What the adapter delivers back to the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundReply {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_artifacts: Vec<ToolArtifact>,
    pub outcome: LoopOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopOutcome {
    Done,
    Failed { error_kind: ErrorKind },
}

impl LoopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopOutcome::Done => "done",
            LoopOutcome::Failed { .. } => "failed",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// handle_inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process one inbound message and return the reply to deliver.
///
/// Waits for the session's run lock, then for a worker-pool slot: a
/// session never runs two loops at once, and messages queued behind a busy
/// session hold no slot, so other sessions run in parallel up to
/// `max_concurrent_turns`.
///
/// `Err` only for storage failures; model and tool failures come back as
/// a reply with a `failed` outcome.
pub async fn handle_inbound(ctx: &EngineContext, msg: InboundMessage) -> Result<OutboundReply> {
    let key = msg.session_key();
    let span = tracing::info_span!("agent.turn", session_key = %key, channel = %msg.channel);

    async {
        let _run = ctx
            .session_locks
            .acquire(&key)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        let _worker = ctx
            .workers
            .acquire()
            .await
            .map_err(|_| Error::Other("worker pool closed".into()))?;

        tracing::debug!("turn started");
        run_loop(ctx, &key, &msg).await
    }
    .instrument(span)
    .await
}

/// User-turn text: the message followed by one line per attachment.
pub(crate) fn render_user_text(msg: &InboundMessage) -> String {
    let mut text = msg.text.clone();
    for a in &msg.attachments {
        if !text.is_empty() {
            text.push('\n');
        }
        match &a.mime_type {
            Some(mime) => text.push_str(&format!("[attachment: {} ({mime}) at {}]", a.name, a.location)),
            None => text.push_str(&format!("[attachment: {} at {}]", a.name, a.location)),
        }
    }
    text
}
