//! Provider credentials: API keys with round-robin rotation, or OAuth
//! access tokens from an injected [`TokenProvider`].
//!
//! [`AuthRotator`] hands out keys in round-robin order. When a key is
//! rejected, callers invoke [`AuthRotator::mark_failed`] to put it into a
//! cooldown window. Keys in cooldown are skipped; if every key is cooling
//! down, the least-recently-failed key is returned instead.
//!
//! OAuth tokens are never minted or refreshed here. Whatever owns the
//! login flow implements [`TokenProvider`] and is handed to the registry
//! at startup.

use na_domain::config::{AuthConfig, AuthMode};
use na_domain::error::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default cooldown period after a key failure (seconds).
const DEFAULT_COOLDOWN_SECS: u64 = 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Source of OAuth access tokens, injected at startup.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid access token.
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token, mostly for tests and short-lived setups.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: String,
    /// Unix timestamp (seconds).
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Reads `{"access_token": "...", "expires_at": <unix secs>}` on every call,
/// so an external login helper can rotate the file underneath us.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Auth(format!(
                "reading token file {}: {e}",
                self.path.display()
            ))
        })?;
        let file: TokenFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Auth(format!("parsing token file: {e}")))?;
        if let Some(expires_at) = file.expires_at {
            if expires_at <= chrono::Utc::now().timestamp() {
                return Err(Error::Auth(format!(
                    "oauth token in {} has expired",
                    self.path.display()
                )));
            }
        }
        if file.access_token.is_empty() {
            return Err(Error::Auth("oauth token file has an empty access_token".into()));
        }
        Ok(file.access_token)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key rotation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct KeySlot {
    key: String,
    /// When the key last failed. `None` means it is healthy.
    failed_at: Option<Instant>,
}

/// Thread-safe round-robin key rotator with failure cooldown.
pub struct AuthRotator {
    /// At least one slot is always present after construction.
    slots: Mutex<Vec<KeySlot>>,
    index: AtomicUsize,
    cooldown: Duration,
}

impl AuthRotator {
    fn new(keys: Vec<String>, cooldown: Duration) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Auth(
                "AuthRotator requires at least one resolved API key".into(),
            ));
        }
        let slots = keys
            .into_iter()
            .map(|key| KeySlot {
                key,
                failed_at: None,
            })
            .collect();
        Ok(Self {
            slots: Mutex::new(slots),
            index: AtomicUsize::new(0),
            cooldown,
        })
    }

    /// Build a rotator from an [`AuthConfig`].
    ///
    /// Resolution order:
    /// 1. `auth.key` (direct) or `auth.env` (env var), a single key.
    /// 2. Else every env var named in `auth.keys`, rotated round-robin.
    pub fn from_auth_config(auth: &AuthConfig) -> Result<Self> {
        let resolved = if auth.key.is_some() || auth.env.is_some() || auth.keys.is_empty() {
            vec![crate::util::resolve_api_key(auth)?]
        } else {
            let mut resolved_keys = Vec::with_capacity(auth.keys.len());
            for env_name in &auth.keys {
                match std::env::var(env_name) {
                    Ok(val) if !val.is_empty() => resolved_keys.push(val),
                    _ => {
                        return Err(Error::Auth(format!(
                            "environment variable '{}' not set or empty \
                             (from auth.keys list)",
                            env_name
                        )));
                    }
                }
            }
            resolved_keys
        };

        Self::new(resolved, Duration::from_secs(DEFAULT_COOLDOWN_SECS))
    }

    /// Return the next healthy key using round-robin.
    pub fn next_key(&self) -> KeyEntry {
        let slots = self.slots.lock();
        let len = slots.len();
        let now = Instant::now();

        if len == 1 {
            return KeyEntry {
                index: 0,
                key: slots[0].key.clone(),
            };
        }

        let start = self.index.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let slot = &slots[idx];
            if let Some(failed_at) = slot.failed_at {
                if now.duration_since(failed_at) < self.cooldown {
                    continue;
                }
            }
            return KeyEntry {
                index: idx,
                key: slot.key.clone(),
            };
        }

        // All keys are cooling down: the one that failed longest ago wins.
        let mut best = 0;
        for (i, slot) in slots.iter().enumerate() {
            if slot.failed_at.unwrap_or(now) < slots[best].failed_at.unwrap_or(now) {
                best = i;
            }
        }
        KeyEntry {
            index: best,
            key: slots[best].key.clone(),
        }
    }

    /// Mark a key at the given index as failed, starting its cooldown timer.
    pub fn mark_failed(&self, index: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(index) {
            slot.failed_at = Some(Instant::now());
            tracing::warn!(
                key_index = index,
                cooldown_secs = self.cooldown.as_secs(),
                "API key marked as failed, entering cooldown"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Manual Debug impl to avoid leaking key values.
impl std::fmt::Debug for AuthRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRotator")
            .field("key_count", &self.len())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

/// A key entry returned by [`AuthRotator::next_key`].
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub index: usize,
    pub key: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How an adapter authenticates each request.
pub enum Credentials {
    ApiKey(AuthRotator),
    OAuth(Arc<dyn TokenProvider>),
    None,
}

/// One resolved secret plus the rotator slot it came from.
#[derive(Debug, Clone)]
pub struct Credential {
    pub secret: String,
    pub key_index: Option<usize>,
    pub oauth: bool,
}

impl Credentials {
    /// Build credentials for a provider.
    ///
    /// `mode = oauth` uses the injected token provider, or a
    /// [`FileTokenProvider`] when the config names a `token_file`.
    pub fn from_auth_config(
        auth: &AuthConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self> {
        match auth.mode {
            AuthMode::ApiKey => Ok(Credentials::ApiKey(AuthRotator::from_auth_config(auth)?)),
            AuthMode::Oauth => match (token_provider, &auth.token_file) {
                (Some(tp), _) => Ok(Credentials::OAuth(tp)),
                (None, Some(path)) => Ok(Credentials::OAuth(Arc::new(FileTokenProvider::new(
                    path.clone(),
                )))),
                (None, None) => Err(Error::Auth(
                    "oauth provider has no injected token provider and no token_file".into(),
                )),
            },
            AuthMode::None => Ok(Credentials::None),
        }
    }

    pub async fn resolve(&self) -> Result<Option<Credential>> {
        match self {
            Credentials::ApiKey(rotator) => {
                let entry = rotator.next_key();
                Ok(Some(Credential {
                    secret: entry.key,
                    key_index: Some(entry.index),
                    oauth: false,
                }))
            }
            Credentials::OAuth(tp) => Ok(Some(Credential {
                secret: tp.access_token().await?,
                key_index: None,
                oauth: true,
            })),
            Credentials::None => Ok(None),
        }
    }

    /// Put a rejected API key into cooldown. No-op for OAuth tokens.
    pub fn report_rejected(&self, cred: &Credential) {
        if let (Credentials::ApiKey(rotator), Some(index)) = (self, cred.key_index) {
            rotator.mark_failed(index);
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::ApiKey(r) => f.debug_tuple("ApiKey").field(r).finish(),
            Credentials::OAuth(_) => f.write_str("OAuth"),
            Credentials::None => f.write_str("None"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_keys() {
        let rotator = AuthRotator::new(
            vec!["a".into(), "b".into(), "c".into()],
            Duration::from_secs(60),
        )
        .unwrap();

        let seen: Vec<String> = (0..6).map(|_| rotator.next_key().key).collect();
        assert_eq!(seen, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn mark_failed_skips_key() {
        let rotator = AuthRotator::new(
            vec!["a".into(), "b".into(), "c".into()],
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(rotator.next_key().key, "a");
        rotator.mark_failed(1);
        // start=1 is cooling down, so "c" is next.
        assert_eq!(rotator.next_key().key, "c");
        assert_eq!(rotator.next_key().key, "c");
        assert_eq!(rotator.next_key().key, "a");
    }

    #[test]
    fn all_failed_returns_least_recently_failed() {
        let rotator =
            AuthRotator::new(vec!["a".into(), "b".into()], Duration::from_secs(60)).unwrap();
        rotator.mark_failed(0);
        std::thread::sleep(Duration::from_millis(10));
        rotator.mark_failed(1);
        assert_eq!(rotator.next_key().key, "a");
    }

    #[test]
    fn empty_keys_returns_error() {
        assert!(AuthRotator::new(vec![], Duration::from_secs(60)).is_err());
    }

    #[test]
    fn direct_key_wins_over_rotation_list() {
        let auth = AuthConfig {
            key: Some("direct-key".into()),
            keys: vec!["NA_TEST_UNUSED_ROTATION_VAR".into()],
            ..AuthConfig::default()
        };
        let rotator = AuthRotator::from_auth_config(&auth).unwrap();
        assert_eq!(rotator.next_key().key, "direct-key");
        assert_eq!(rotator.len(), 1);
    }

    #[test]
    fn rotation_list_with_missing_env_fails() {
        let auth = AuthConfig {
            keys: vec!["NA_TEST_NONEXISTENT_VAR_12345".into()],
            ..AuthConfig::default()
        };
        assert!(AuthRotator::from_auth_config(&auth).is_err());
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let rotator =
            AuthRotator::new(vec!["secret-key".into()], Duration::from_secs(60)).unwrap();
        let debug_str = format!("{:?}", rotator);
        assert!(!debug_str.contains("secret-key"));
        assert!(debug_str.contains("key_count: 1"));
    }

    #[tokio::test]
    async fn oauth_prefers_injected_provider() {
        let auth = AuthConfig {
            mode: AuthMode::Oauth,
            token_file: Some("/nonexistent/token.json".into()),
            ..AuthConfig::default()
        };
        let creds =
            Credentials::from_auth_config(&auth, Some(Arc::new(StaticTokenProvider::new("tok"))))
                .unwrap();
        let cred = creds.resolve().await.unwrap().unwrap();
        assert_eq!(cred.secret, "tok");
        assert!(cred.oauth);
    }

    #[test]
    fn oauth_without_source_is_an_error() {
        let auth = AuthConfig {
            mode: AuthMode::Oauth,
            ..AuthConfig::default()
        };
        assert!(Credentials::from_auth_config(&auth, None).is_err());
    }

    #[tokio::test]
    async fn file_token_provider_reads_and_checks_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let future = chrono::Utc::now().timestamp() + 3_600;
        std::fs::write(
            &path,
            format!(r#"{{"access_token":"abc","expires_at":{future}}}"#),
        )
        .unwrap();
        let tp = FileTokenProvider::new(&path);
        assert_eq!(tp.access_token().await.unwrap(), "abc");

        std::fs::write(&path, r#"{"access_token":"abc","expires_at":1}"#).unwrap();
        let err = tp.access_token().await.unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn none_mode_resolves_to_no_credential() {
        let auth = AuthConfig {
            mode: AuthMode::None,
            ..AuthConfig::default()
        };
        let creds = Credentials::from_auth_config(&auth, None).unwrap();
        assert!(creds.resolve().await.unwrap().is_none());
    }
}
