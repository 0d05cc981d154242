//! Session management for nanoagent.
//!
//! A session is the ordered turn history of one `(channel, sender)` pair.
//! Turns are appended to a per-session JSONL file as they happen, so a
//! restart rebuilds the same history. Sessions idle past their TTL are
//! evicted lazily on the next access.

pub mod lock;
pub mod session_key;
pub mod store;
pub mod transcript;

pub use lock::{SessionLockClosed, SessionLockMap};
pub use session_key::{file_stem, session_key};
pub use store::{Clock, Session, SessionStore};
pub use transcript::{LoadedTranscript, TurnLog, TurnRecord};
