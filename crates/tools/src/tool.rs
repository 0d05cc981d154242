//! The invoker interface every tool implements, built-in or remote.

use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Who is calling, passed to every invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_key: String,
    pub channel: String,
    pub sender_id: String,
    pub call_id: String,
}

/// A successful invocation: the payload answered to the model, plus any
/// artifacts for the channel adapter.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub payload: Value,
    pub artifacts: Vec<(String, Value)>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Value::String(text.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn json(payload: Value) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, kind: impl Into<String>, value: Value) -> Self {
        self.artifacts.push((kind.into(), value));
        self
    }
}

pub type InvokeResult = std::result::Result<ToolOutput, ToolError>;

/// `name → invoke` behind one interface. Arguments arrive already
/// validated against the declared schema.
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> InvokeResult;
}

/// A tool compiled into the binary. It knows its own schema and budget.
pub trait BuiltinTool: ToolInvoker {
    fn definition(&self) -> ToolDefinition;

    /// Dispatcher deadline for one call.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Descriptor plus deadline, as the registry stores it.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub definition: ToolDefinition,
    pub timeout: Duration,
}

/// A built-in ready to register.
#[derive(Clone)]
pub struct Builtin {
    pub spec: ToolSpec,
    pub invoker: Arc<dyn ToolInvoker>,
}

impl Builtin {
    pub fn new<T: BuiltinTool + 'static>(tool: T) -> Self {
        let spec = ToolSpec {
            definition: tool.definition(),
            timeout: tool.timeout(),
        };
        Self {
            spec,
            invoker: Arc::new(tool),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.definition.name
    }
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builtin").field("spec", &self.spec).finish_non_exhaustive()
    }
}

/// Deserialize validated arguments into a request struct.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::validation(format!("invalid arguments: {e}")))
}
