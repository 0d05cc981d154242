//! Session key derivation.
//!
//! Keys are `<channel>:<senderId>` with an optional `:<thread>` suffix.
//! The same key always maps to the same transcript file name.

/// Compute the session key for an inbound message.
pub fn session_key(channel: &str, sender_id: &str, thread: Option<&str>) -> String {
    let channel = normalize(channel);
    let sender = sender_id.trim();
    match thread.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => format!("{channel}:{sender}:{t}"),
        None => format!("{channel}:{sender}"),
    }
}

/// Map a session key to a file stem that is safe on every filesystem.
///
/// Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so distinct keys
/// never collide.
pub fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    // Leading dots would produce hidden files or `..`.
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
