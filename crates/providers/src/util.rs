//! Shared utility functions for provider adapters.

use na_domain::config::AuthConfig;
use na_domain::error::{Error, Result};
use serde_json::Value;

/// Longest slice of an error body kept in a provider error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Build the error for a non-success HTTP response, keeping the status so
/// the router can tell transient failures from fatal ones.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let mut message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    if message.len() < body.len() {
        message.push_str("...");
    }
    Error::Provider {
        provider: provider.to_string(),
        status: Some(status.as_u16()),
        message: format!("HTTP {} - {}", status.as_u16(), message),
    }
}

/// Decode a tool-call `arguments` string.
///
/// Empty input means "no arguments". Input that is not valid JSON is kept
/// as a string so schema validation rejects it instead of the call
/// silently running with `{}`.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Id for a tool call the server sent without one. Results are matched
/// back to calls by id, so an empty or shared id is never used.
pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Resolve a single API key from an [`AuthConfig`].
///
/// Precedence:
/// 1. `key` field (plaintext, warns)
/// 2. `env` field (reads environment variable)
/// 3. Error
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!(
            "API key loaded from plaintext config field 'key', prefer 'env' instead"
        );
        return Ok(key.clone());
    }

    if let Some(ref env_var) = auth.env {
        return match std::env::var(env_var) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Err(Error::Auth(format!(
                "environment variable '{}' not set or empty",
                env_var
            ))),
        };
    }

    Err(Error::Auth(
        "no API key configured: set 'key', 'env' or 'keys' in the provider auth".into(),
    ))
}
