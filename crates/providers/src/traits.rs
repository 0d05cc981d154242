use na_domain::capability::LlmCapabilities;
use na_domain::error::Result;
use na_domain::stream::{BoxStream, StreamEvent, Usage};
use na_domain::tool::{ToolCall, ToolDefinition, Turn};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// System prompt, kept apart from the turns because the wire formats
    /// disagree on where it goes.
    pub system: Option<String>,
    /// The conversation so far, oldest first.
    pub turns: Vec<Turn>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature (0.0 – 2.0). `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model name inside the provider namespace (`gpt-4o`, not `openai/gpt-4o`).
    pub model: String,
    /// Prompt-cache key, set by the router for providers that want one.
    pub cache_key: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// The model that actually produced the response.
    pub model: String,
    /// The reason the model stopped generating (e.g. "stop", "tool_calls").
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    /// The assistant turn this response represents.
    pub fn into_turn(self) -> Turn {
        Turn::Assistant {
            text: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls: self.tool_calls,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// Adapters translate between [`Turn`]s and the wire format of one
/// provider's HTTP API. Retries and timeouts live in the router, so an
/// adapter makes exactly one attempt per call.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The advertised capabilities of this provider.
    fn capabilities(&self) -> &LlmCapabilities;

    /// The namespace this provider answers to in model ids.
    fn provider_id(&self) -> &str;

    /// Whether the router should compute and attach a prompt-cache key.
    fn wants_cache_key(&self) -> bool {
        false
    }
}
