//! Tool registry and dispatcher.
//!
//! Built-in and tool-server tools live in one table, `name → {descriptor,
//! invoker}`. Dispatch is a lookup, then argument validation, then the
//! invocation under the tool's deadline. Every call yields exactly one
//! [`ToolResult`]; nothing here returns an error to the agent loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::Instrument;

use na_domain::error::{ErrorKind, ToolError};
use na_domain::tool::{ToolArtifact, ToolCall, ToolDefinition, ToolResult};
use na_domain::trace::TraceEvent;
use na_tools::{Builtin, ToolContext, ToolInvoker};

use super::schema;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "server", rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    Server(String),
}

impl std::fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolOrigin::Builtin => write!(f, "builtin"),
            ToolOrigin::Server(name) => write!(f, "server:{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub definition: ToolDefinition,
    pub origin: ToolOrigin,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ToolDescriptor {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{name}' is already registered by {existing}")]
    Duplicate { name: String, existing: ToolOrigin },

    #[error("invalid tool name '{0}'")]
    InvalidName(String),
}

/// The answer to one call plus whatever artifacts it produced.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: ToolResult,
    pub artifacts: Vec<ToolArtifact>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    seq: u64,
    descriptor: ToolDescriptor,
    invoker: Arc<dyn ToolInvoker>,
}

/// Shared by every session. Registration and removal take a write lock;
/// dispatch clones the entry out and runs without holding any lock.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    next_seq: AtomicU64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. Names are unique: a second registration under the same
    /// name is rejected, whatever its origin.
    pub fn register(
        &self,
        descriptor: ToolDescriptor,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<(), RegistryError> {
        let name = descriptor.name().to_string();
        if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
            return Err(RegistryError::InvalidName(name));
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&name) {
            return Err(RegistryError::Duplicate {
                name,
                existing: existing.descriptor.origin.clone(),
            });
        }
        tracing::debug!(tool = %name, origin = %descriptor.origin, "tool registered");
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            name,
            Arc::new(Entry {
                seq,
                descriptor,
                invoker,
            }),
        );
        Ok(())
    }

    pub fn register_builtin(&self, tool: Builtin) -> Result<(), RegistryError> {
        let descriptor = ToolDescriptor {
            definition: tool.spec.definition,
            origin: ToolOrigin::Builtin,
            timeout: tool.spec.timeout,
        };
        self.register(descriptor, tool.invoker)
    }

    /// Remove every tool from `origin`. Returns how many were removed.
    pub fn unregister_origin(&self, origin: &ToolOrigin) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| &e.descriptor.origin != origin);
        before - entries.len()
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.entries.read().get(name).map(|e| e.descriptor.clone())
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut entries: Vec<Arc<Entry>> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Definitions for the provider, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors().into_iter().map(|d| d.definition).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run one call. Unknown tools, invalid arguments, timeouts, panics and
    /// tool failures all come back as error results for that call id.
    pub async fn dispatch(&self, ctx: &ToolContext, call: &ToolCall) -> Dispatched {
        let span = tracing::info_span!(
            "tool.call",
            tool_name = %call.tool_name,
            call_id = %call.call_id,
        );
        async {
            let start = Instant::now();
            let outcome = self.run(ctx, call).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let dispatched = match outcome {
                Ok(output) => Dispatched {
                    artifacts: output
                        .artifacts
                        .into_iter()
                        .map(|(kind, value)| ToolArtifact {
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            kind,
                            value,
                        })
                        .collect(),
                    result: ToolResult::ok(call, output.payload),
                },
                Err(err) => {
                    tracing::debug!(kind = %err.kind.as_str(), error = %err.message, "tool call failed");
                    Dispatched {
                        result: ToolResult::error(call, err),
                        artifacts: Vec::new(),
                    }
                }
            };

            let error_kind = dispatched.result.error_kind();
            TraceEvent::ToolDispatched {
                session_key: ctx.session_key.clone(),
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                duration_ms,
                status: if error_kind.is_some() { "error" } else { "ok" },
                error_kind: error_kind.map(|k| k.as_str().to_string()),
            }
            .emit();
            dispatched
        }
        .instrument(span)
        .await
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> na_tools::InvokeResult {
        let entry = self.entries.read().get(&call.tool_name).cloned();
        let Some(entry) = entry else {
            tracing::warn!(tool = %call.tool_name, "model called unknown tool");
            return Err(ToolError::new(
                ErrorKind::ToolNotFound,
                format!(
                    "Tool '{}' does not exist. Available tools: {}",
                    call.tool_name,
                    self.names().join(", ")
                ),
            ));
        };

        schema::validate(&entry.descriptor.definition.parameters, &call.arguments).map_err(|msg| {
            ToolError::validation(format!("Invalid arguments for tool '{}': {msg}", call.tool_name))
        })?;

        let call_ctx = ToolContext {
            call_id: call.call_id.clone(),
            ..ctx.clone()
        };
        let timeout = entry.descriptor.timeout;
        // Dropping the future on timeout cancels the invocation; tools that
        // own processes kill them on drop.
        let invocation = AssertUnwindSafe(entry.invoker.invoke(&call_ctx, call.arguments.clone()))
            .catch_unwind();
        match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => {
                tracing::error!(tool = %call.tool_name, "tool panicked");
                Err(ToolError::execution(format!("Tool '{}' crashed", call.tool_name)))
            }
            Err(_) => Err(ToolError::timeout(format!(
                "Tool '{}' timed out after {}s",
                call.tool_name,
                timeout.as_secs_f64()
            ))),
        }
    }

    fn names(&self) -> Vec<String> {
        self.descriptors()
            .into_iter()
            .map(|d| d.definition.name)
            .collect()
    }
}
