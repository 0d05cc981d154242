use serde::{Deserialize, Serialize};

/// What a provider adapter can do. The router and the agent loop read this;
/// nothing else does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCapabilities {
    /// Tool definitions may be sent. When false the router drops them.
    #[serde(default)]
    pub supports_tools: bool,
    /// The adapter implements `chat_stream`; the router prefers it.
    #[serde(default)]
    pub supports_streaming: bool,
    /// Several tool calls in one turn are independent and may run at once.
    #[serde(default)]
    pub supports_parallel_tools: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
}
