//! Provider router.
//!
//! Resolves `<provider>/<model>` ids against the [`ProviderRegistry`],
//! retries transient failures with bounded exponential backoff, and folds
//! streamed responses into a single assistant [`Turn`].

use crate::cache_key::cache_key;
use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use futures_util::StreamExt;
use na_domain::capability::LlmCapabilities;
use na_domain::config::LlmConfig;
use na_domain::error::{Error, Result};
use na_domain::stream::{BoxStream, StreamEvent, Usage};
use na_domain::tool::{ToolCall, ToolDefinition, Turn};
use na_domain::trace::TraceEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call generation settings that are not part of the turn history.
#[derive(Debug, Clone, Default)]
pub struct SamplingParams {
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One finished model call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Always a [`Turn::Assistant`].
    pub turn: Turn,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub attempts: u32,
}

pub struct ProviderRouter {
    registry: ProviderRegistry,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl ProviderRouter {
    pub fn from_config(llm_config: &LlmConfig, registry: ProviderRegistry) -> Self {
        Self::new(
            registry,
            RetryPolicy::from_config(llm_config),
            Duration::from_millis(llm_config.timeout_ms),
        )
    }

    pub fn new(registry: ProviderRegistry, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            registry,
            retry,
            attempt_timeout,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Capabilities of the provider serving `model_id`.
    pub fn capabilities(&self, model_id: &str) -> Result<LlmCapabilities> {
        let (provider, _) = self.resolve(model_id)?;
        Ok(provider.capabilities().clone())
    }

    /// Produce the next assistant turn for `turns`.
    ///
    /// Transient failures (timeouts, connection errors, 5xx, 429) are
    /// retried up to `max_retries` times. Everything else propagates on the
    /// first failure.
    pub async fn complete(
        &self,
        turns: &[Turn],
        model_id: &str,
        tools: &[ToolDefinition],
        params: &SamplingParams,
    ) -> Result<Completion> {
        let (provider, model) = self.resolve(model_id)?;
        let caps = provider.capabilities();
        let streaming = caps.supports_streaming;
        if !caps.supports_tools && !tools.is_empty() {
            tracing::debug!(model_id, dropped = tools.len(), "provider has no tool support");
        }

        let req = ChatRequest {
            system: params.system.clone(),
            turns: turns.to_vec(),
            tools: if caps.supports_tools { tools.to_vec() } else { Vec::new() },
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            model: model.to_string(),
            cache_key: provider
                .wants_cache_key()
                .then(|| cache_key(params.system.as_deref(), turns)),
        };

        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt(&provider, &req, streaming).await {
                Ok(resp) => {
                    let usage = resp.usage;
                    let finish_reason = resp.finish_reason.clone();
                    let turn = resp.into_turn();
                    TraceEvent::ModelCalled {
                        provider: provider.provider_id().to_string(),
                        model: model.to_string(),
                        streaming,
                        attempts: attempt,
                        duration_ms: start.elapsed().as_millis() as u64,
                        tool_calls: turn.tool_calls().len(),
                        prompt_tokens: usage.map(|u| u.prompt_tokens),
                        completion_tokens: usage.map(|u| u.completion_tokens),
                    }
                    .emit();
                    return Ok(Completion {
                        turn,
                        usage,
                        finish_reason,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    TraceEvent::ProviderRetry {
                        provider: provider.provider_id().to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: e.to_string(),
                    }
                    .emit();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.provider_id(),
                        model = %model,
                        attempts = attempt,
                        transient = e.is_transient(),
                        error = %e,
                        "model call failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn resolve<'a>(&self, model_id: &'a str) -> Result<(Arc<dyn LlmProvider>, &'a str)> {
        let (provider_id, model) = parse_model_id(model_id)?;
        let provider = self.registry.get(provider_id).ok_or_else(|| {
            Error::Config(format!(
                "no provider '{}' for model id '{}' (registered: {})",
                provider_id,
                model_id,
                self.registry.list_providers().join(", ")
            ))
        })?;
        Ok((provider, model))
    }

    /// One request with the per-attempt timeout.
    async fn attempt(
        &self,
        provider: &Arc<dyn LlmProvider>,
        req: &ChatRequest,
        streaming: bool,
    ) -> Result<ChatResponse> {
        let call = async {
            if streaming {
                let stream = provider.chat_stream(req).await?;
                accumulate_stream(provider.provider_id(), &req.model, stream).await
            } else {
                provider.chat(req).await
            }
        };
        match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "provider '{}' timed out after {}ms",
                provider.provider_id(),
                self.attempt_timeout.as_millis()
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split `"provider/model"`. Only the first `/` separates, so
/// `openrouter/meta-llama/llama-3` names model `meta-llama/llama-3`.
pub fn parse_model_id(model_id: &str) -> Result<(&str, &str)> {
    match model_id.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(Error::Config(format!(
            "model id '{}' must look like '<provider>/<model>'",
            model_id
        ))),
    }
}

struct PartialCall {
    call_id: String,
    tool_name: String,
    args: String,
    finished: Option<serde_json::Value>,
}

/// Fold a provider event stream into one response.
///
/// Tool calls keep the order in which they started. A `ToolCallFinished`
/// event wins over accumulated deltas. Multiple `Done` events are merged:
/// the first finish reason and the last usage win.
pub async fn accumulate_stream(
    provider: &str,
    model: &str,
    mut stream: BoxStream<'static, Result<StreamEvent>>,
) -> Result<ChatResponse> {
    let mut content = String::new();
    let mut calls: Vec<PartialCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Token { text } => content.push_str(&text),
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                if !calls.iter().any(|c| c.call_id == call_id) {
                    calls.push(PartialCall {
                        call_id,
                        tool_name,
                        args: String::new(),
                        finished: None,
                    });
                }
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some(c) = calls.iter_mut().find(|c| c.call_id == call_id) {
                    c.args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => match calls.iter_mut().find(|c| c.call_id == call_id) {
                Some(c) => c.finished = Some(arguments),
                None => calls.push(PartialCall {
                    call_id,
                    tool_name,
                    args: String::new(),
                    finished: Some(arguments),
                }),
            },
            StreamEvent::Done {
                usage: u,
                finish_reason: fr,
            } => {
                if u.is_some() {
                    usage = u;
                }
                if finish_reason.is_none() {
                    finish_reason = fr;
                }
            }
            StreamEvent::Error { message } => {
                return Err(Error::Provider {
                    provider: provider.to_string(),
                    status: None,
                    message: format!("stream error: {message}"),
                });
            }
        }
    }

    if let Some(c) = calls.iter().find(|c| c.tool_name.is_empty()) {
        return Err(Error::Provider {
            provider: provider.to_string(),
            status: None,
            message: format!("tool call {} without a function name", c.call_id),
        });
    }
    let tool_calls = calls
        .into_iter()
        .map(|c| ToolCall {
            arguments: c
                .finished
                .unwrap_or_else(|| crate::util::parse_arguments(&c.args)),
            call_id: c.call_id,
            tool_name: c.tool_name,
        })
        .collect();

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays a fixed list of outcomes, one per call.
    struct ScriptedProvider {
        id: String,
        caps: LlmCapabilities,
        script: Mutex<VecDeque<Result<ChatResponse>>>,
        seen: Mutex<Vec<ChatRequest>>,
        cache: bool,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ChatResponse>>) -> Self {
            Self {
                id: "mock".into(),
                caps: LlmCapabilities {
                    supports_tools: true,
                    ..LlmCapabilities::default()
                },
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                cache: false,
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.seen.lock().push(req.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Other("script exhausted".into())))
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Err(Error::Other("not streaming".into()))
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.caps
        }

        fn provider_id(&self) -> &str {
            &self.id
        }

        fn wants_cache_key(&self) -> bool {
            self.cache
        }
    }

    fn text(t: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: t.into(),
            ..ChatResponse::default()
        })
    }

    fn status(code: u16) -> Result<ChatResponse> {
        Err(Error::Provider {
            provider: "mock".into(),
            status: Some(code),
            message: format!("HTTP {code}"),
        })
    }

    fn router(provider: Arc<ScriptedProvider>, max_retries: u32) -> ProviderRouter {
        let mut registry = ProviderRegistry::default();
        registry.insert(provider);
        ProviderRouter::new(
            registry,
            RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[test]
    fn model_id_requires_namespace() {
        assert_eq!(parse_model_id("openai/gpt-4o").unwrap(), ("openai", "gpt-4o"));
        assert_eq!(
            parse_model_id("openrouter/meta-llama/llama-3").unwrap(),
            ("openrouter", "meta-llama/llama-3")
        );
        assert!(parse_model_id("gpt-4o").is_err());
        assert!(parse_model_id("/gpt-4o").is_err());
        assert!(parse_model_id("openai/").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let p = Arc::new(ScriptedProvider::new(vec![status(503), status(429), text("hi")]));
        let out = router(p.clone(), 2)
            .complete(&[Turn::user("hello")], "mock/m1", &[], &SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(out.turn.text(), Some("hi"));
        assert_eq!(p.calls(), 3);
        assert_eq!(p.seen.lock()[0].model, "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let p = Arc::new(ScriptedProvider::new(vec![
            status(500),
            status(502),
            status(503),
            text("too late"),
        ]));
        let err = router(p.clone(), 2)
            .complete(&[Turn::user("x")], "mock/m", &[], &SamplingParams::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let p = Arc::new(ScriptedProvider::new(vec![status(401), text("never")]));
        let err = router(p.clone(), 2)
            .complete(&[Turn::user("x")], "mock/m", &[], &SamplingParams::default())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_and_bad_model_id_are_fatal() {
        let p = Arc::new(ScriptedProvider::new(vec![]));
        let r = router(p.clone(), 2);
        let params = SamplingParams::default();
        assert!(matches!(
            r.complete(&[], "nope/m", &[], &params).await,
            Err(Error::Config(_))
        ));
        assert!(matches!(
            r.complete(&[], "no-namespace", &[], &params).await,
            Err(Error::Config(_))
        ));
        assert_eq!(p.calls(), 0);
    }

    #[tokio::test]
    async fn cache_key_is_attached_only_when_wanted() {
        let mut inner = ScriptedProvider::new(vec![text("a"), text("b")]);
        inner.cache = true;
        let p = Arc::new(inner);
        let r = router(p.clone(), 0);
        let params = SamplingParams {
            system: Some("sys".into()),
            ..SamplingParams::default()
        };
        let turns = vec![Turn::user("hello")];
        r.complete(&turns, "mock/m", &[], &params).await.unwrap();
        r.complete(&turns, "mock/m", &[], &params).await.unwrap();
        let seen = p.seen.lock();
        let k1 = seen[0].cache_key.clone().unwrap();
        assert_eq!(Some(k1.clone()), seen[1].cache_key);
        assert_eq!(k1, cache_key(Some("sys"), &turns));
    }

    fn events(list: Vec<Result<StreamEvent>>) -> BoxStream<'static, Result<StreamEvent>> {
        Box::pin(futures_util::stream::iter(list))
    }

    #[tokio::test]
    async fn stream_folds_into_one_turn() {
        let stream = events(vec![
            Ok(StreamEvent::Token { text: "Let me ".into() }),
            Ok(StreamEvent::Token { text: "check.".into() }),
            Ok(StreamEvent::ToolCallStarted {
                call_id: "a".into(),
                tool_name: "read_file".into(),
            }),
            Ok(StreamEvent::ToolCallStarted {
                call_id: "b".into(),
                tool_name: "list_dir".into(),
            }),
            Ok(StreamEvent::ToolCallDelta {
                call_id: "b".into(),
                delta: "{\"path\":".into(),
            }),
            Ok(StreamEvent::ToolCallDelta {
                call_id: "a".into(),
                delta: "{\"path\":\"x\"}".into(),
            }),
            Ok(StreamEvent::ToolCallDelta {
                call_id: "b".into(),
                delta: "\".\"}".into(),
            }),
            Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            }),
            Ok(StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 4,
                    completion_tokens: 6,
                    total_tokens: 10,
                }),
                finish_reason: None,
            }),
        ]);
        let resp = accumulate_stream("mock", "m", stream).await.unwrap();
        assert_eq!(resp.content, "Let me check.");
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(resp.usage.unwrap().total_tokens, 10);
        let names: Vec<&str> = resp.tool_calls.iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, vec!["read_file", "list_dir"]);
        assert_eq!(resp.tool_calls[0].arguments, json!({"path": "x"}));
        assert_eq!(resp.tool_calls[1].arguments, json!({"path": "."}));
    }

    #[tokio::test]
    async fn streamed_call_without_name_fails_the_call() {
        let stream = events(vec![
            Ok(StreamEvent::ToolCallStarted {
                call_id: "a".into(),
                tool_name: String::new(),
            }),
            Ok(StreamEvent::ToolCallDelta {
                call_id: "a".into(),
                delta: "{}".into(),
            }),
        ]);
        let err = accumulate_stream("mock", "m", stream).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("without a function name"));
    }

    #[tokio::test]
    async fn stream_error_event_fails_the_call() {
        let stream = events(vec![
            Ok(StreamEvent::Token { text: "par".into() }),
            Ok(StreamEvent::Error {
                message: "invalid request".into(),
            }),
        ]);
        let err = accumulate_stream("mock", "m", stream).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("invalid request"));
    }
}
