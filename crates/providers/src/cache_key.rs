//! Deterministic prompt-cache keys.
//!
//! The key is a hex SHA-256 over the system prompt and the serialized turn
//! sequence. It is recomputed on every call and never stored.

use na_domain::tool::Turn;
use sha2::{Digest, Sha256};

pub fn cache_key(system: Option<&str>, turns: &[Turn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"system\0");
    hasher.update(system.unwrap_or("").as_bytes());
    for turn in turns {
        // Struct fields serialize in declaration order and `Value` maps are
        // sorted, so the same turns always produce the same bytes.
        let bytes = serde_json::to_vec(turn).unwrap_or_default();
        hasher.update(b"\0turn\0");
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}
