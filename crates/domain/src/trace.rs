use serde::Serialize;

/// Structured trace events emitted across all nanoagent crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    LoopStarted {
        session_key: String,
        channel: String,
        history_turns: usize,
    },
    ModelCalled {
        provider: String,
        model: String,
        streaming: bool,
        attempts: u32,
        duration_ms: u64,
        tool_calls: usize,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    ProviderRetry {
        provider: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    ToolDispatched {
        session_key: String,
        call_id: String,
        tool_name: String,
        duration_ms: u64,
        status: &'static str,
        error_kind: Option<String>,
    },
    LoopFinished {
        session_key: String,
        iterations: usize,
        outcome: String,
    },
    SessionCreated {
        session_key: String,
    },
    SessionLoaded {
        session_key: String,
        turns: usize,
        skipped_records: usize,
    },
    SessionEvicted {
        session_key: String,
        idle_secs: i64,
    },
    ToolServerConnected {
        server: String,
        transport: &'static str,
        tools: usize,
    },
    ToolServerDown {
        server: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "na_event");
    }
}
