//! Provider router: model-id parsing, provider adapters, retry policy and
//! streaming accumulation.

pub mod anthropic;
pub mod auth;
pub mod cache_key;
pub mod openai_compat;
pub mod registry;
pub mod router;
pub mod sse;
pub mod traits;
pub mod util;

pub use auth::{FileTokenProvider, StaticTokenProvider, TokenProvider};
pub use registry::ProviderRegistry;
pub use router::{
    accumulate_stream, parse_model_id, Completion, ProviderRouter, RetryPolicy, SamplingParams,
};
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
