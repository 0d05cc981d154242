use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default model, format: "provider_id/model_name".
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_8192")]
    pub max_tokens: u32,
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Maximum model calls per inbound message.
    #[serde(default = "d_40")]
    pub max_iterations: usize,
    /// Number of most recent turns sent to the provider.
    #[serde(default = "d_100")]
    pub history_window: usize,
    /// Worker pool size: inbound messages processed at once across sessions.
    #[serde(default = "d_8")]
    pub max_concurrent_turns: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Reply sent to the user when the loop fails on a provider error.
    #[serde(default = "d_error_reply")]
    pub error_reply: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            max_tokens: 8192,
            temperature: d_temperature(),
            max_iterations: 40,
            history_window: 100,
            max_concurrent_turns: 8,
            system_prompt: None,
            error_reply: d_error_reply(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_model() -> String {
    "anthropic/claude-sonnet-4-5".into()
}
fn d_8192() -> u32 {
    8192
}
fn d_temperature() -> f32 {
    0.1
}
fn d_40() -> usize {
    40
}
fn d_100() -> usize {
    100
}
fn d_8() -> usize {
    8
}
fn d_error_reply() -> String {
    "Sorry, I ran into a problem and could not finish that request.".into()
}
