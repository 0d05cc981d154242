//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances. At startup
//! the registry reads the [`LlmConfig`], resolves authentication, and
//! instantiates the adapter for each configured provider.

use crate::anthropic::AnthropicProvider;
use crate::auth::TokenProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use na_domain::config::{LlmConfig, ProviderKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Holds all instantiated LLM providers, keyed by namespace.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Build the registry with no injected token providers.
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::from_config_with_tokens(config, HashMap::new())
    }

    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// `tokens` maps provider ids to the token provider used for
    /// `mode = "oauth"` providers. Providers that fail to initialize are
    /// logged and skipped rather than aborting startup.
    pub fn from_config_with_tokens(
        config: &LlmConfig,
        mut tokens: HashMap<String, Arc<dyn TokenProvider>>,
    ) -> Self {
        let mut registry = Self::default();

        for pc in &config.providers {
            let token_provider = tokens.remove(&pc.id);
            let result: na_domain::Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::OpenaiCompat => OpenAiCompatProvider::from_config(pc, token_provider)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                ProviderKind::Anthropic => AnthropicProvider::from_config(pc, token_provider)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
            };

            match result {
                Ok(provider) => {
                    tracing::info!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        auth = ?pc.auth.mode,
                        "registered LLM provider"
                    );
                    registry.providers.insert(pc.id.clone(), provider);
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        error = %e,
                        "failed to initialize LLM provider, skipping"
                    );
                }
            }
        }

        if registry.is_empty() && !config.providers.is_empty() {
            tracing::warn!(
                "no LLM providers initialized; model calls will fail until auth is configured"
            );
        }

        registry
    }

    /// Register (or replace) a provider under its own id.
    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.provider_id().to_string(), provider);
    }

    /// Look up a provider by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// All registered provider IDs (sorted).
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
