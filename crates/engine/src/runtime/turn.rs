//! The agent loop: one run per inbound message.
//!
//! ```text
//! AwaitingModel ──(tool calls)──▶ DispatchingTools ──▶ AwaitingModel ...
//!       │                                                   │
//!       └──(plain answer)──▶ Done        (cap / fatal) ──▶ Failed
//! ```
//!
//! Every turn is appended to the session store as soon as it exists, so a
//! failed run leaves its partial history (tool results included) in place.

use futures_util::future::join_all;

use na_domain::error::{ErrorKind, Result};
use na_domain::tool::{ToolArtifact, ToolCall, Turn};
use na_domain::trace::TraceEvent;
use na_providers::SamplingParams;
use na_tools::ToolContext;

use crate::state::EngineContext;

use super::tools::Dispatched;
use super::{render_user_text, InboundMessage, LoopOutcome, OutboundReply};

#[derive(Debug)]
enum LoopState {
    AwaitingModel,
    DispatchingTools(Vec<ToolCall>),
    Done(String),
    Failed { kind: ErrorKind, reason: String },
}

/// Message shown to the user when the iteration cap is hit.
pub fn iteration_cap_reply(max_iterations: usize) -> String {
    format!("I could not complete this request within {max_iterations} steps.")
}

/// Run the state machine for `msg` on session `key`.
///
/// The caller holds the session's run lock for the whole call.
pub async fn run_loop(ctx: &EngineContext, key: &str, msg: &InboundMessage) -> Result<OutboundReply> {
    let agent = &ctx.agent;
    let model = agent.model.as_str();

    let session = ctx.sessions.get_or_create(key).await?;
    TraceEvent::LoopStarted {
        session_key: key.to_string(),
        channel: msg.channel.clone(),
        history_turns: session.turns.len(),
    }
    .emit();

    ctx.sessions
        .append(
            key,
            Turn::User {
                text: render_user_text(msg),
                metadata: serde_json::json!({
                    "channel": msg.channel,
                    "sender_id": msg.sender_id,
                }),
            },
        )
        .await?;

    let parallel = match ctx.router.capabilities(model) {
        Ok(caps) => caps.supports_parallel_tools,
        Err(e) => {
            tracing::debug!(error = %e, "capabilities unavailable, dispatching sequentially");
            false
        }
    };
    let params = SamplingParams {
        system: Some(ctx.context.system_prompt(msg).await),
        temperature: Some(agent.temperature),
        max_tokens: Some(agent.max_tokens),
    };
    let tool_ctx = ToolContext {
        session_key: key.to_string(),
        channel: msg.channel.clone(),
        sender_id: msg.sender_id.clone(),
        call_id: String::new(),
    };

    let mut iterations = 0usize;
    let mut artifacts: Vec<ToolArtifact> = Vec::new();
    let mut state = LoopState::AwaitingModel;

    let (text, outcome) = loop {
        state = match state {
            LoopState::AwaitingModel => {
                if iterations >= agent.max_iterations {
                    LoopState::Failed {
                        kind: ErrorKind::IterationCapExceeded,
                        reason: format!("reached {} model calls", agent.max_iterations),
                    }
                } else {
                    iterations += 1;
                    let history = ctx.sessions.history(key, agent.history_window).await?;
                    // Snapshot per call: tool servers may come and go mid-run.
                    let definitions = ctx.tools.definitions();
                    match ctx.router.complete(&history, model, &definitions, &params).await {
                        Ok(completion) => {
                            let calls = completion.turn.tool_calls().to_vec();
                            let text = completion.turn.text().unwrap_or_default().to_string();
                            ctx.sessions.append(key, completion.turn).await?;
                            if calls.is_empty() {
                                LoopState::Done(text)
                            } else {
                                LoopState::DispatchingTools(calls)
                            }
                        }
                        Err(e) => LoopState::Failed {
                            kind: e.kind(),
                            reason: e.to_string(),
                        },
                    }
                }
            }

            LoopState::DispatchingTools(calls) => {
                tracing::debug!(count = calls.len(), parallel, "dispatching tool calls");
                let results = dispatch_all(ctx, &tool_ctx, &calls, parallel).await;
                // Appended in the assistant's call order, whatever order they finished in.
                for d in results {
                    artifacts.extend(d.artifacts);
                    ctx.sessions.append(key, Turn::ToolResult(d.result)).await?;
                }
                LoopState::AwaitingModel
            }

            LoopState::Done(text) => break (text, LoopOutcome::Done),

            LoopState::Failed { kind, reason } => {
                tracing::warn!(error_kind = %kind, reason = %reason, iterations, "agent loop failed");
                let reply = match kind {
                    ErrorKind::IterationCapExceeded => iteration_cap_reply(agent.max_iterations),
                    _ => agent.error_reply.clone(),
                };
                // The user saw this reply, so the history records it too.
                ctx.sessions.append(key, Turn::assistant(reply.clone())).await?;
                break (reply, LoopOutcome::Failed { error_kind: kind });
            }
        };
    };

    TraceEvent::LoopFinished {
        session_key: key.to_string(),
        iterations,
        outcome: match &outcome {
            LoopOutcome::Done => "done".to_string(),
            LoopOutcome::Failed { error_kind } => format!("failed:{error_kind}"),
        },
    }
    .emit();

    Ok(OutboundReply {
        text,
        tool_artifacts: artifacts,
        outcome,
    })
}

/// One result per call, in call order.
async fn dispatch_all(
    ctx: &EngineContext,
    tool_ctx: &ToolContext,
    calls: &[ToolCall],
    parallel: bool,
) -> Vec<Dispatched> {
    if parallel && calls.len() > 1 {
        join_all(calls.iter().map(|call| ctx.tools.dispatch(tool_ctx, call))).await
    } else {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            out.push(ctx.tools.dispatch(tool_ctx, call).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use na_domain::capability::LlmCapabilities;
    use na_domain::config::{AgentConfig, SessionsConfig};
    use na_domain::error::{Error, ToolError};
    use na_domain::stream::{BoxStream, StreamEvent};
    use na_domain::tool::ToolDefinition;
    use na_providers::{
        ChatRequest, ChatResponse, LlmProvider, ProviderRegistry, ProviderRouter, RetryPolicy,
    };
    use na_sessions::SessionStore;
    use na_tools::{InvokeResult, ToolInvoker, ToolOutput};

    use super::*;
    use crate::runtime::tools::{ToolDescriptor, ToolOrigin, ToolRegistry};

    struct ScriptedProvider {
        caps: LlmCapabilities,
        script: Mutex<VecDeque<Result<ChatResponse>>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.seen.lock().push(req.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(calls(&[("noop", json!({}))])))
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

    /// Sleeps for `ms` from the arguments, then reports its tag.
    struct Delayed;

    #[async_trait::async_trait]
    impl ToolInvoker for Delayed {
        async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutput::text(format!("tag={}", args["tag"].as_str().unwrap_or("")))
                .with_artifact("delay", json!(ms)))
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl ToolInvoker for Broken {
        async fn invoke(&self, _ctx: &ToolContext, _args: Value) -> InvokeResult {
            Err(ToolError::execution("disk on fire"))
        }
    }

    fn text(t: &str) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: t.into(),
            ..Default::default()
        })
    }

    fn calls(list: &[(&str, Value)]) -> ChatResponse {
        ChatResponse {
            tool_calls: list
                .iter()
                .enumerate()
                .map(|(i, (name, args))| ToolCall {
                    call_id: format!("c{i}"),
                    tool_name: (*name).into(),
                    arguments: args.clone(),
                })
                .collect(),
            ..Default::default()
        }
    }

    struct Harness {
        ctx: EngineContext,
        provider: Arc<ScriptedProvider>,
        _dir: tempfile::TempDir,
    }

    fn harness(script: Vec<Result<ChatResponse>>, parallel: bool, max_iterations: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider {
            caps: LlmCapabilities {
                supports_tools: true,
                supports_parallel_tools: parallel,
                ..LlmCapabilities::default()
            },
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = ProviderRegistry::default();
        registry.insert(provider.clone());
        let retry = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let router = ProviderRouter::new(registry, retry, Duration::from_secs(5));

        let tools = ToolRegistry::new();
        for (name, invoker) in [
            ("delayed", Arc::new(Delayed) as Arc<dyn ToolInvoker>),
            ("noop", Arc::new(Delayed)),
            ("broken", Arc::new(Broken)),
        ] {
            tools
                .register(
                    ToolDescriptor {
                        definition: ToolDefinition {
                            name: name.into(),
                            description: format!("{name} tool"),
                            parameters: json!({ "type": "object" }),
                        },
                        origin: ToolOrigin::Builtin,
                        timeout: Duration::from_secs(5),
                    },
                    invoker,
                )
                .unwrap();
        }

        let agent = AgentConfig {
            model: "mock/test".into(),
            max_iterations,
            system_prompt: Some("be brief".into()),
            ..AgentConfig::default()
        };
        let sessions = SessionStore::new(dir.path(), SessionsConfig::default().ttl()).unwrap();
        let ctx = EngineContext::new(agent, Arc::new(sessions), Arc::new(router), Arc::new(tools));
        Harness {
            ctx,
            provider,
            _dir: dir,
        }
    }

    fn inbound(text: &str) -> InboundMessage {
        InboundMessage::new("cli", "alice", text)
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_iteration() {
        let h = harness(vec![text("hello there")], false, 5);
        let msg = inbound("hi");
        let reply = run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();

        assert_eq!(reply.text, "hello there");
        assert_eq!(reply.outcome, LoopOutcome::Done);

        {
            let seen = h.provider.seen.lock();
            assert_eq!(seen.len(), 1);
            let system = seen[0].system.as_deref().unwrap();
            assert!(system.contains("be brief"));
            assert!(system.contains("## Current Session\nChannel: cli\nChat ID: alice"));
            assert_eq!(seen[0].tools.len(), 3);
            assert!(seen[0].turns.last().is_some_and(|t| t.is_user()));
        }

        let history = h.ctx.sessions.history(&msg.session_key(), 100).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), Some("hello there"));
    }

    #[tokio::test]
    async fn parallel_results_are_recorded_in_call_order() {
        let h = harness(
            vec![
                Ok(calls(&[
                    ("delayed", json!({ "tag": "slow", "ms": 200 })),
                    ("delayed", json!({ "tag": "fast", "ms": 0 })),
                ])),
                text("both done"),
            ],
            true,
            5,
        );
        let msg = inbound("go");
        let started = tokio::time::Instant::now();
        let reply = run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();

        assert_eq!(reply.text, "both done");
        assert_eq!(reply.tool_artifacts.len(), 2);
        assert_eq!(reply.tool_artifacts[0].call_id, "c0");
        assert!(started.elapsed() < Duration::from_millis(390));

        let history = h.ctx.sessions.history(&msg.session_key(), 100).await.unwrap();
        let results: Vec<_> = history
            .iter()
            .filter_map(|t| match t {
                Turn::ToolResult(r) => Some((r.call_id.clone(), r.content_text())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "c0");
        assert!(results[0].1.contains("slow"));
        assert_eq!(results[1].0, "c1");
    }

    #[tokio::test]
    async fn sequential_dispatch_without_parallel_support() {
        let h = harness(
            vec![
                Ok(calls(&[
                    ("delayed", json!({ "tag": "a", "ms": 150 })),
                    ("delayed", json!({ "tag": "b", "ms": 150 })),
                ])),
                text("ok"),
            ],
            false,
            5,
        );
        let msg = inbound("go");
        let started = tokio::time::Instant::now();
        run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn tool_errors_go_back_to_the_model() {
        let h = harness(vec![Ok(calls(&[("broken", json!({}))])), text("sorry")], false, 5);
        let msg = inbound("try it");
        let reply = run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();
        assert_eq!(reply.outcome, LoopOutcome::Done);

        let seen = h.provider.seen.lock();
        let last = seen[1].turns.last().unwrap();
        match last {
            Turn::ToolResult(r) => {
                assert!(r.is_error());
                assert_eq!(r.error_kind(), Some(ErrorKind::ToolExecution));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn iteration_cap_keeps_partial_history() {
        // The script is empty, so every model call asks for another tool.
        let h = harness(vec![], false, 3);
        let msg = inbound("loop forever");
        let key = msg.session_key();
        let reply = run_loop(&h.ctx, &key, &msg).await.unwrap();

        assert_eq!(
            reply.outcome,
            LoopOutcome::Failed {
                error_kind: ErrorKind::IterationCapExceeded
            }
        );
        assert_eq!(reply.text, iteration_cap_reply(3));
        assert_eq!(h.provider.seen.lock().len(), 3);

        let history = h.ctx.sessions.history(&key, 100).await.unwrap();
        // user, 3 x (assistant + tool result), final reply
        assert_eq!(history.len(), 8);
        let tool_results = history
            .iter()
            .filter(|t| matches!(t, Turn::ToolResult(_)))
            .count();
        assert_eq!(tool_results, 3);
        assert_eq!(history[7].text(), Some(reply.text.as_str()));
    }

    #[tokio::test]
    async fn fatal_provider_error_ends_with_error_reply() {
        let h = harness(
            vec![Err(Error::Provider {
                provider: "mock".into(),
                status: Some(401),
                message: "bad key".into(),
            })],
            false,
            5,
        );
        let msg = inbound("hi");
        let reply = run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();
        assert_eq!(
            reply.outcome,
            LoopOutcome::Failed {
                error_kind: ErrorKind::FatalProvider
            }
        );
        assert_eq!(reply.text, h.ctx.agent.error_reply);
    }

    #[tokio::test]
    async fn second_message_sees_earlier_history() {
        let h = harness(vec![text("first"), text("second")], false, 5);
        let msg = inbound("one");
        run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();
        let msg = inbound("two");
        run_loop(&h.ctx, &msg.session_key(), &msg).await.unwrap();

        let seen = h.provider.seen.lock();
        assert_eq!(seen[1].turns.len(), 3);
        assert_eq!(seen[1].turns[0].text(), Some("one"));
    }
}
