//! In-memory session table backed by the durable turn log.
//!
//! The map lock is only held to look up or insert a slot. Each slot has its
//! own async mutex, so operations on one key are serialized while different
//! keys never wait on each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use na_domain::error::Result;
use na_domain::tool::Turn;
use na_domain::trace::TraceEvent;
use parking_lot::Mutex;

use crate::transcript::{TurnLog, TurnRecord};

/// Source of "now". Injected so tests can move time forward.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// One conversation's state.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
    /// Records skipped while loading this session from disk.
    pub skipped_records: usize,
}

impl Session {
    fn new(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_owned(),
            created_at: now,
            last_active_at: now,
            turns: Vec::new(),
            skipped_records: 0,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_active_at > ttl
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Session>>>;

pub struct SessionStore {
    log: TurnLog,
    ttl: Duration,
    clock: Clock,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionStore {
    pub fn new(dir: &Path, ttl: Duration) -> Result<Self> {
        Ok(Self {
            log: TurnLog::new(dir)?,
            ttl,
            clock: Arc::new(Utc::now),
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the session for `key`, creating an empty one if it is absent
    /// or expired. Other expired sessions are swept opportunistically.
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        let now = (self.clock)();
        self.sweep_expired(key, now).await;

        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.ensure_live(&mut guard, key, now).await?;
        Ok(guard.clone().unwrap_or_else(|| Session::new(key, now)))
    }

    /// Append a turn. The record is on disk before the in-memory history
    /// changes, and concurrent appends to the same key are serialized.
    pub async fn append(&self, key: &str, turn: Turn) -> Result<()> {
        let now = (self.clock)();
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.ensure_live(&mut guard, key, now).await?;

        let session = guard.get_or_insert_with(|| Session::new(key, now));
        let record = TurnRecord {
            ts: now,
            seq: session.turns.len() as u64,
            turn,
        };
        self.log.append(key, &record).await?;

        session.turns.push(record.turn);
        session.last_active_at = now;
        Ok(())
    }

    /// Append several turns in order.
    pub async fn append_all(&self, key: &str, turns: Vec<Turn>) -> Result<()> {
        for turn in turns {
            self.append(key, turn).await?;
        }
        Ok(())
    }

    /// Evict `key` if its TTL has elapsed. Returns whether it was evicted.
    pub async fn evict_if_expired(&self, key: &str) -> Result<bool> {
        let now = (self.clock)();
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            self.load(&mut guard, key, now).await?;
        }
        let expired = guard
            .as_ref()
            .map(|s| s.is_expired(now, self.ttl))
            .unwrap_or(false);
        if expired {
            self.evict(&mut guard, key, now).await?;
        }
        Ok(expired)
    }

    /// The last `window` turns, adjusted so the slice starts at a user turn.
    ///
    /// Starting anywhere else could hand the provider tool results whose
    /// calls were cut off. A tool run longer than `window` is kept whole
    /// back to its user turn.
    pub async fn history(&self, key: &str, window: usize) -> Result<Vec<Turn>> {
        let session = self.get_or_create(key).await?;
        Ok(windowed(&session.turns, window))
    }

    /// Number of sessions currently held in memory.
    pub fn cached_count(&self) -> usize {
        self.slots.lock().len()
    }

    // ── Private helpers ───────────────────────────────────────────────

    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Load from disk if not yet in memory, then evict if expired.
    async fn ensure_live(
        &self,
        guard: &mut Option<Session>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if guard.is_none() {
            self.load(guard, key, now).await?;
        }
        if guard
            .as_ref()
            .map(|s| s.is_expired(now, self.ttl))
            .unwrap_or(false)
        {
            self.evict(guard, key, now).await?;
        }
        if guard.is_none() {
            *guard = Some(Session::new(key, now));
            TraceEvent::SessionCreated {
                session_key: key.to_owned(),
            }
            .emit();
        }
        Ok(())
    }

    async fn load(
        &self,
        guard: &mut Option<Session>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let loaded = self.log.read(key).await?;
        if loaded.records.is_empty() && loaded.skipped == 0 {
            return Ok(());
        }

        let created_at = loaded.records.first().map(|r| r.ts).unwrap_or(now);
        let last_active_at = loaded.records.last().map(|r| r.ts).unwrap_or(now);
        let session = Session {
            key: key.to_owned(),
            created_at,
            last_active_at,
            turns: loaded.records.into_iter().map(|r| r.turn).collect(),
            skipped_records: loaded.skipped,
        };

        TraceEvent::SessionLoaded {
            session_key: key.to_owned(),
            turns: session.turns.len(),
            skipped_records: session.skipped_records,
        }
        .emit();

        *guard = Some(session);
        Ok(())
    }

    async fn evict(&self, guard: &mut Option<Session>, key: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(old) = guard.take() {
            TraceEvent::SessionEvicted {
                session_key: key.to_owned(),
                idle_secs: (now - old.last_active_at).num_seconds(),
            }
            .emit();
        }
        self.log.retire(key, now).await?;
        Ok(())
    }

    /// Drop expired sessions other than `except` that nobody is using.
    async fn sweep_expired(&self, except: &str, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        {
            let mut slots = self.slots.lock();
            slots.retain(|key, slot| {
                // A task that cloned the slot but has not locked it yet
                // would otherwise keep a detached copy alive.
                if key == except || Arc::strong_count(slot) > 1 {
                    return true;
                }
                let Ok(guard) = slot.try_lock() else {
                    return true;
                };
                match guard.as_ref() {
                    Some(s) if s.is_expired(now, self.ttl) => {
                        expired.push((key.clone(), s.last_active_at));
                        false
                    }
                    _ => true,
                }
            });
        }

        for (key, last_active_at) in expired {
            if let Err(e) = self.log.retire(&key, now).await {
                tracing::warn!(session_key = %key, error = %e, "failed to retire expired session");
            }
            TraceEvent::SessionEvicted {
                session_key: key,
                idle_secs: (now - last_active_at).num_seconds(),
            }
            .emit();
        }
    }
}

/// Start at the first user turn inside the window. When the window holds
/// only assistant and tool turns (one long tool run), start at the user
/// turn that opened the run instead, even if that exceeds `window`.
fn windowed(turns: &[Turn], window: usize) -> Vec<Turn> {
    let cut = turns.len().saturating_sub(window);
    let start = match turns[cut..].iter().position(Turn::is_user) {
        Some(offset) => cut + offset,
        None => turns[..cut].iter().rposition(Turn::is_user).unwrap_or(cut),
    };
    turns[start..].to_vec()
}
