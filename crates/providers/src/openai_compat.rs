//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, OpenRouter, Together, and
//! any other endpoint that follows the OpenAI chat completions contract.

use crate::auth::{Credential, Credentials, TokenProvider};
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::{from_reqwest, parse_arguments, status_error, synthesize_call_id};
use na_domain::capability::LlmCapabilities;
use na_domain::config::ProviderConfig;
use na_domain::error::{Error, Result};
use na_domain::stream::{BoxStream, StreamEvent, Usage};
use na_domain::tool::{ToolCall, ToolDefinition, ToolResult, Turn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    credentials: Credentials,
    auth_header: String,
    auth_prefix: String,
    extra_headers: HashMap<String, String>,
    prompt_cache: bool,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(
        cfg: &ProviderConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        let credentials = Credentials::from_auth_config(&cfg.auth, token_provider)?;
        let auth_header = cfg
            .auth
            .header
            .clone()
            .unwrap_or_else(|| "Authorization".into());
        let auth_prefix = cfg.auth.prefix.clone().unwrap_or_else(|| "Bearer ".into());

        let capabilities = LlmCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_parallel_tools: cfg.parallel_tool_calls.unwrap_or(true),
            context_window_tokens: Some(128_000),
        };

        // Whole-request deadlines come from the router.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credentials,
            auth_header,
            auth_prefix,
            extra_headers: cfg.extra_headers.clone(),
            prompt_cache: cfg.prompt_cache,
            capabilities,
            client,
        })
    }

    // ── Internal: build authenticated request builder ──────────────

    async fn authed_post(&self, url: &str) -> Result<(reqwest::RequestBuilder, Option<Credential>)> {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        let cred = self.credentials.resolve().await?;
        if let Some(ref c) = cred {
            builder = builder.header(&self.auth_header, format!("{}{}", self.auth_prefix, c.secret));
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        Ok((builder, cred))
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(provider = %self.id, url = %url, "openai_compat request");

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

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(req.turns.len() + 1);
        if let Some(ref system) = req.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.extend(req.turns.iter().map(turn_to_openai));

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
            if !self.capabilities.supports_parallel_tools {
                body["parallel_tool_calls"] = Value::Bool(false);
            }
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(ref key) = req.cache_key {
            body["prompt_cache_key"] = Value::String(key.clone());
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn turn_to_openai(turn: &Turn) -> Value {
    match turn {
        Turn::User { text, .. } => serde_json::json!({"role": "user", "content": text}),
        Turn::Assistant { text, tool_calls } => assistant_to_openai(text.as_deref(), tool_calls),
        Turn::ToolResult(result) => tool_result_to_openai(result),
    }
}

fn assistant_to_openai(text: Option<&str>, tool_calls: &[ToolCall]) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    obj["content"] = match text {
        Some(t) if !t.is_empty() => Value::String(t.to_string()),
        _ => Value::Null,
    };
    if !tool_calls.is_empty() {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                // Arguments that never parsed are echoed back verbatim.
                let arguments = match &tc.arguments {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                serde_json::json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.tool_name,
                        "arguments": arguments,
                    }
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

fn tool_result_to_openai(result: &ToolResult) -> Value {
    serde_json::json!({
        "role": "tool",
        "tool_call_id": result.call_id,
        "content": result.content_text(),
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn malformed(provider: &str, message: &str) -> Error {
    Error::Provider {
        provider: provider.to_string(),
        status: None,
        message: message.to_string(),
    }
}

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| malformed(provider, "no choices in response"))?;

    let message = choice
        .get("message")
        .ok_or_else(|| malformed(provider, "no message in choice"))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(ChatResponse {
        content,
        tool_calls: parse_openai_tool_calls(provider, message)?,
        usage: body.get("usage").and_then(parse_openai_usage),
        model,
        finish_reason,
    })
}

/// A call without an id gets a synthesized one. A call without a function
/// name cannot be dispatched, so the whole response is rejected.
fn parse_openai_tool_calls(provider: &str, message: &Value) -> Result<Vec<ToolCall>> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Ok(Vec::new()),
    };
    arr.iter()
        .map(|tc| {
            let func = tc.get("function");
            let tool_name = func
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| malformed(provider, "tool call without a function name"))?
                .to_string();
            let call_id = match tc.get("id").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    let id = synthesize_call_id();
                    tracing::debug!(provider, tool = %tool_name, call_id = %id, "tool call without id");
                    id
                }
            };
            let arguments = match func.and_then(|f| f.get("arguments")) {
                Some(Value::String(raw)) => parse_arguments(raw),
                // Some servers send the object itself.
                Some(v @ Value::Object(_)) => v.clone(),
                _ => Value::Object(Default::default()),
            };
            Ok(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_tokens")?.as_u64()? as u32;
    let completion = v.get("completion_tokens")?.as_u64()? as u32;
    let total = v
        .get("total_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as u32)
        .unwrap_or(prompt + completion);
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call deltas name their call by `index`; only the first chunk of a
/// call carries the id. This maps one to the other.
#[derive(Default)]
struct StreamState {
    call_ids: HashMap<u64, String>,
}

fn parse_sse_data(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown stream error");
        return vec![Ok(StreamEvent::Error {
            message: message.to_string(),
        })];
    }

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    // Usage-only chunk (stream_options.include_usage).
    let Some(choice) = choice else {
        return match v.get("usage").and_then(parse_openai_usage) {
            Some(usage) => vec![Ok(StreamEvent::Done {
                usage: Some(usage),
                finish_reason: None,
            })],
            None => Vec::new(),
        };
    };

    let mut events = Vec::new();
    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token {
                text: text.to_string(),
            }));
        }
    }

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let function = tc.get("function");

            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let id = match tc.get("id").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => Some(id.to_string()),
                _ if !name.is_empty() && !state.call_ids.contains_key(&index) => {
                    Some(synthesize_call_id())
                }
                _ => None,
            };
            if let Some(id) = id {
                state.call_ids.insert(index, id.clone());
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id,
                    tool_name: name.to_string(),
                }));
            }

            if let Some(args) = function
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if let (false, Some(call_id)) = (args.is_empty(), state.call_ids.get(&index)) {
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: call_id.clone(),
                        delta: args.to_string(),
                    }));
                }
            }
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        events.push(Ok(StreamEvent::Done {
            usage: v.get("usage").and_then(parse_openai_usage),
            finish_reason: Some(fr.to_string()),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_chat_body(req, false);
        let resp = self.send(&body).await?;
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_chat_body(req, true);
        let resp = self.send(&body).await?;
        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_data(data, &mut state)
        }))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }

    fn wants_cache_key(&self) -> bool {
        self.prompt_cache
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
