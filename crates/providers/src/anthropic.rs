//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use and streaming.
//! The system prompt goes in a separate top-level `system` field and tool
//! results travel as `tool_result` blocks inside user messages.

use crate::auth::{Credential, Credentials, TokenProvider};
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, parse_arguments, status_error, synthesize_call_id};
use na_domain::capability::LlmCapabilities;
use na_domain::config::ProviderConfig;
use na_domain::error::{Error, Result};
use na_domain::stream::{BoxStream, StreamEvent, Usage};
use na_domain::tool::{ToolCall, ToolDefinition, Turn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Status used for mid-stream `overloaded_error` events.
const OVERLOADED_STATUS: u16 = 529;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    credentials: Credentials,
    auth_header: Option<String>,
    auth_prefix: Option<String>,
    extra_headers: HashMap<String, String>,
    prompt_cache: bool,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(
        cfg: &ProviderConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        let credentials = Credentials::from_auth_config(&cfg.auth, token_provider)?;

        let capabilities = LlmCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_parallel_tools: cfg.parallel_tool_calls.unwrap_or(true),
            context_window_tokens: Some(200_000),
        };

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credentials,
            auth_header: cfg.auth.header.clone(),
            auth_prefix: cfg.auth.prefix.clone(),
            extra_headers: cfg.extra_headers.clone(),
            prompt_cache: cfg.prompt_cache,
            capabilities,
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn authed_post(&self, url: &str) -> Result<(reqwest::RequestBuilder, Option<Credential>)> {
        let mut builder = self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");

        let cred = self.credentials.resolve().await?;
        if let Some(ref c) = cred {
            // API keys go in x-api-key; OAuth access tokens are bearer tokens.
            let (default_header, default_prefix) = if c.oauth {
                ("Authorization", "Bearer ")
            } else {
                ("x-api-key", "")
            };
            let header = self.auth_header.as_deref().unwrap_or(default_header);
            let prefix = self.auth_prefix.as_deref().unwrap_or(default_prefix);
            builder = builder.header(header, format!("{prefix}{}", c.secret));
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        Ok((builder, cred))
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!(provider = %self.id, url = %url, "anthropic request");

        let (builder, cred) = self.authed_post(&url).await?;
        let resp = builder.json(body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            if let (Some(c), 401 | 403 | 429) = (&cred, status.as_u16()) {
                self.credentials.report_rejected(c);
            }
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(status_error(&self.id, status, &err_text));
        }
        Ok(resp)
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let api_messages = turns_to_anthropic(&req.turns);

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": api_messages,
            "stream": stream,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(ref system) = req.system {
            body["system"] = if self.prompt_cache {
                serde_json::json!([{
                    "type": "text",
                    "text": system,
                    "cache_control": {"type": "ephemeral"},
                }])
            } else {
                Value::String(system.clone())
            };
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
            if !self.capabilities.supports_parallel_tools {
                body["tool_choice"] =
                    serde_json::json!({"type": "auto", "disable_parallel_tool_use": true});
            }
        }

        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert turns to Anthropic messages.
///
/// Consecutive tool results are merged into one user message, since the API
/// wants every `tool_result` for an assistant turn in the next message.
fn turns_to_anthropic(turns: &[Turn]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(turns.len());
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(serde_json::json!({
                "role": "user",
                "content": std::mem::take(pending),
            }));
        }
    };

    for turn in turns {
        match turn {
            Turn::ToolResult(result) => {
                pending_results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": result.content_text(),
                    "is_error": result.is_error(),
                }));
            }
            Turn::User { text, .. } => {
                flush(&mut out, &mut pending_results);
                out.push(serde_json::json!({"role": "user", "content": text}));
            }
            Turn::Assistant { text, tool_calls } => {
                flush(&mut out, &mut pending_results);
                out.push(assistant_to_anthropic(text.as_deref(), tool_calls));
            }
        }
    }
    flush(&mut out, &mut pending_results);
    out
}

fn assistant_to_anthropic(text: Option<&str>, tool_calls: &[ToolCall]) -> Value {
    let mut content: Vec<Value> = Vec::with_capacity(tool_calls.len() + 1);
    if let Some(t) = text.filter(|t| !t.is_empty()) {
        content.push(serde_json::json!({"type": "text", "text": t}));
    }
    for tc in tool_calls {
        // `input` must be an object even when the model sent garbage.
        let input = if tc.arguments.is_object() {
            tc.arguments.clone()
        } else {
            Value::Object(Default::default())
        };
        content.push(serde_json::json!({
            "type": "tool_use",
            "id": tc.call_id,
            "name": tc.tool_name,
            "input": input,
        }));
    }
    serde_json::json!({
        "role": "assistant",
        "content": content,
    })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn parse_anthropic_response(body: &Value) -> Result<ChatResponse> {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    let blocks = body.get("content").and_then(|v| v.as_array());
    for block in blocks.into_iter().flatten() {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                let tool_name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| Error::Provider {
                        provider: "anthropic".into(),
                        status: None,
                        message: "tool_use block without a name".into(),
                    })?
                    .to_string();
                let call_id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .unwrap_or_else(synthesize_call_id);
                let arguments = block
                    .get("input")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            _ => {}
        }
    }

    Ok(ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage: body.get("usage").and_then(parse_anthropic_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        finish_reason: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(map_stop_reason),
    })
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage {
        prompt_tokens: input,
        completion_tokens: output,
        total_tokens: input + output,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool calls under assembly, keyed by content block index.
struct PendingToolUse {
    call_id: String,
    tool_name: String,
    args: String,
}

struct StreamState {
    provider: String,
    active_tool_calls: HashMap<u64, PendingToolUse>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new(provider: String) -> Self {
        Self {
            provider,
            active_tool_calls: HashMap::new(),
            usage: None,
            done_emitted: false,
        }
    }
}

fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_anthropic_usage);
            }
        }

        "content_block_start" => {
            let block = v.get("content_block").unwrap_or(&Value::Null);
            if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                let call_id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .unwrap_or_else(synthesize_call_id);
                let tool_name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                }));
                state.active_tool_calls.insert(
                    idx,
                    PendingToolUse {
                        call_id,
                        tool_name,
                        args: String::new(),
                    },
                );
            }
        }

        "content_block_delta" => {
            let delta = v.get("delta").unwrap_or(&Value::Null);
            match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            events.push(Ok(StreamEvent::Token {
                                text: text.to_string(),
                            }));
                        }
                    }
                }
                "input_json_delta" => {
                    if let (Some(partial), Some(tc)) = (
                        delta.get("partial_json").and_then(|v| v.as_str()),
                        state.active_tool_calls.get_mut(&idx),
                    ) {
                        tc.args.push_str(partial);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            call_id: tc.call_id.clone(),
                            delta: partial.to_string(),
                        }));
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            if let Some(tc) = state.active_tool_calls.remove(&idx) {
                events.push(Ok(StreamEvent::ToolCallFinished {
                    call_id: tc.call_id,
                    tool_name: tc.tool_name,
                    arguments: parse_arguments(&tc.args),
                }));
            }
        }

        "message_delta" => {
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|v| v.as_u64())
            {
                let u = state.usage.get_or_insert_with(Usage::default);
                u.completion_tokens = output as u32;
                u.total_tokens = u.prompt_tokens + u.completion_tokens;
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(map_stop_reason);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage,
                    finish_reason: stop_reason,
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage,
                    finish_reason: Some("stop".into()),
                }));
            }
        }

        "error" => {
            let err = v.get("error").unwrap_or(&Value::Null);
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            // Server-side overload mid-stream is worth another attempt.
            match err.get("type").and_then(|v| v.as_str()) {
                Some("overloaded_error") | Some("api_error") => {
                    events.push(Err(Error::Provider {
                        provider: state.provider.clone(),
                        status: Some(OVERLOADED_STATUS),
                        message,
                    }));
                }
                _ => events.push(Ok(StreamEvent::Error { message })),
            }
        }

        // ping and unknown event types
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_messages_body(req, false);
        let resp = self.send(&body).await?;
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_anthropic_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_messages_body(req, true);
        let resp = self.send(&body).await?;
        let mut state = StreamState::new(self.id.clone());
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_anthropic_sse(data, &mut state)
        }))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
