use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use na_domain::capability::LlmCapabilities;
use na_domain::config::{Config, WorkspaceConfig};
use na_domain::error::{Error, Result};
use na_domain::stream::{BoxStream, StreamEvent};
use na_domain::tool::{ToolCall, Turn};
use na_providers::{
    ChatRequest, ChatResponse, LlmProvider, ProviderRegistry, ProviderRouter, RetryPolicy,
};

/// Pops one scripted response per model call and records every request.
pub struct ScriptedProvider {
    caps: LlmCapabilities,
    script: Mutex<VecDeque<ChatResponse>>,
    latency: Duration,
    pub seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ChatResponse>, parallel: bool) -> Arc<Self> {
        Self::with_latency(script, parallel, Duration::ZERO)
    }

    /// Every model call sleeps for `latency` before answering.
    pub fn with_latency(script: Vec<ChatResponse>, parallel: bool, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            caps: LlmCapabilities {
                supports_tools: true,
                supports_parallel_tools: parallel,
                ..LlmCapabilities::default()
            },
            script: Mutex::new(script.into()),
            latency,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Tool results the model saw in request `n`, in order.
    pub fn tool_results(&self, n: usize) -> Vec<(String, Value)> {
        self.seen.lock()[n]
            .turns
            .iter()
            .filter_map(|t| match t {
                Turn::ToolResult(r) => {
                    let v: Value = serde_json::from_str(&r.content_text())
                        .unwrap_or_else(|_| Value::String(r.content_text()));
                    Some((r.call_id.clone(), v))
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.seen.lock().push(req.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Other("script exhausted".into()))
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
        "mock"
    }
}

pub fn router(provider: Arc<ScriptedProvider>) -> ProviderRouter {
    let mut registry = ProviderRegistry::default();
    registry.insert(provider);
    let retry = RetryPolicy {
        max_retries: 0,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    };
    ProviderRouter::new(registry, retry, Duration::from_secs(10))
}

pub fn answer(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        ..Default::default()
    }
}

pub fn call_tools(calls: &[(&str, &str, Value)]) -> ChatResponse {
    ChatResponse {
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                call_id: (*id).into(),
                tool_name: (*name).into(),
                arguments: args.clone(),
            })
            .collect(),
        ..Default::default()
    }
}

/// Config rooted in `dir`, talking to the scripted provider.
pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.agent.model = "mock/test".into();
    config.workspace = WorkspaceConfig {
        path: dir.join("workspace"),
        state_path: dir.join("state"),
    };
    config
}

pub fn workspace(dir: &Path) -> PathBuf {
    dir.join("workspace")
}
