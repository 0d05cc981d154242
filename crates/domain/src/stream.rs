use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One decoded piece of a streaming completion.
///
/// Adapters produce these from their SSE frames; `accumulate_stream`
/// folds them back into a single assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token { text: String },
    ToolCallStarted { call_id: String, tool_name: String },
    /// A fragment of a tool call's JSON arguments.
    ToolCallDelta { call_id: String, delta: String },
    /// Arguments complete. Adapters that only send deltas never emit this.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    /// The provider reported an error mid-stream.
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
