//! One run at a time per session.
//!
//! The agent loop takes a session's permit before touching its history and
//! holds it until the reply is ready; a second message for the same key
//! queues behind it. Different keys never contend beyond the map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Idle entries are swept once the map grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("session lock closed")]
pub struct SessionLockClosed;

#[derive(Default)]
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `session_key`. Dropping the permit releases it.
    pub async fn acquire(&self, session_key: &str) -> Result<OwnedSemaphorePermit, SessionLockClosed> {
        let sem = {
            let mut locks = self.locks.lock();
            if locks.len() >= PRUNE_THRESHOLD {
                retain_busy(&mut locks);
            }
            Arc::clone(
                locks
                    .entry(session_key.to_owned())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        sem.acquire_owned().await.map_err(|_| SessionLockClosed)
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Forget keys nobody holds or waits on.
    pub fn prune_idle(&self) {
        retain_busy(&mut self.locks.lock());
    }
}

// A held permit or a pending acquire owns a clone of the Arc.
fn retain_busy(locks: &mut HashMap<String, Arc<Semaphore>>) {
    locks.retain(|_, sem| Arc::strong_count(sem) > 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_queues_behind_the_holder() {
        let map = Arc::new(SessionLockMap::new());
        let first = map.acquire("cli:alice").await.unwrap();

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move {
                let _second = map.acquire("cli:alice").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn other_keys_are_not_blocked() {
        let map = SessionLockMap::new();
        let _a = map.acquire("cli:alice").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), map.acquire("cli:bob")).await;
        assert!(b.is_ok());
        assert_eq!(map.session_count(), 2);
    }

    #[tokio::test]
    async fn pruning_keeps_held_locks() {
        let map = SessionLockMap::new();
        let held = map.acquire("busy").await.unwrap();
        drop(map.acquire("idle").await.unwrap());

        map.prune_idle();
        assert_eq!(map.session_count(), 1);
        drop(held);
        map.prune_idle();
        assert_eq!(map.session_count(), 0);
    }

    #[tokio::test]
    async fn large_maps_sweep_themselves() {
        let map = SessionLockMap::new();
        for i in 0..PRUNE_THRESHOLD {
            drop(map.acquire(&format!("k{i}")).await.unwrap());
        }
        let _p = map.acquire("fresh").await.unwrap();
        assert_eq!(map.session_count(), 1);
    }
}
