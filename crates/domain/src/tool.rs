use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, ToolError};

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turns
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One unit of conversation history.
///
/// Serialized with a `kind` tag; this is also the persisted record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult(ToolResult),
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User {
            text: text.into(),
            metadata: Value::Null,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Turn::Assistant {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Tool calls requested by an assistant turn (empty for other kinds).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Turn::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Turn::User { .. })
    }

    /// Plain text of a user or assistant turn.
    pub fn text(&self) -> Option<&str> {
        match self {
            Turn::User { text, .. } => Some(text.as_str()),
            Turn::Assistant { text, .. } => text.as_deref(),
            Turn::ToolResult(_) => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Turn::User { .. } => "user",
            Turn::Assistant { .. } => "assistant",
            Turn::ToolResult(_) => "tool_result",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The answer to one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutcome {
    Ok {
        payload: Value,
    },
    Error {
        error_kind: ErrorKind,
        message: String,
    },
}

impl ToolResult {
    pub fn ok(call: &ToolCall, payload: Value) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Ok { payload },
        }
    }

    pub fn error(call: &ToolCall, err: ToolError) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome: ToolOutcome::Error {
                error_kind: err.kind,
                message: err.message,
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ToolOutcome::Error { error_kind, .. } => Some(*error_kind),
            ToolOutcome::Ok { .. } => None,
        }
    }

    /// Text handed back to the model for this result.
    pub fn content_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Ok { payload: Value::String(s) } => s.clone(),
            ToolOutcome::Ok { payload } => {
                serde_json::to_string_pretty(payload).unwrap_or_default()
            }
            ToolOutcome::Error {
                error_kind,
                message,
            } => serde_json::json!({
                "error_kind": error_kind,
                "message": message,
            })
            .to_string(),
        }
    }
}

/// Something a tool produced that the channel adapter may want to deliver
/// alongside the final text (a written file, a sent message, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolArtifact {
    pub call_id: String,
    pub tool_name: String,
    pub kind: String,
    pub value: Value,
}
