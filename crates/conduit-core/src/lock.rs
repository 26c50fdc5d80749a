use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{ConduitError, Result};

struct LockState {
    token: String,
    expires_at: Instant,
    notify: Arc<Notify>,
}

/// In-process named mutex with TTL-based reclamation, keyed by lock name.
///
/// spec.md §4.10 prefers an external key-value-backed lock service and
/// falls back to this in-process mutex when one isn't configured; this
/// substrate never wires up an external backend, so this fallback is
/// always the active implementation (recorded in DESIGN.md).
pub struct DistributedLock {
    entries: DashMap<String, LockState>,
}

/// A held lock. `release()` is idempotent; dropping an unreleased handle
/// also releases it, so a panicking holder can't wedge the lock forever.
pub struct LockHandle {
    key: String,
    token: String,
    lock: Arc<DistributedLock>,
    released: bool,
}

impl DistributedLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    /// Attempt to acquire `key`, waiting up to `timeout` for a conflicting
    /// holder to release or expire. `ttl` bounds how long this holder may
    /// keep the lock before another acquirer is allowed to reclaim it.
    pub async fn acquire(
        self: &Arc<Self>,
        key: &str,
        timeout: Duration,
        ttl: Duration,
    ) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            let token = Uuid::new_v4().to_string();
            let now = Instant::now();

            let notify = notify_or_insert(&self.entries, key, &token, ttl, now);

            if let Some(notify) = notify {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ConduitError::LockUnavailable { key: key.to_string() });
                }
                let _ = tokio::time::timeout(remaining, notify.notified()).await;
                if Instant::now() >= deadline {
                    return Err(ConduitError::LockUnavailable { key: key.to_string() });
                }
                continue;
            }

            return Ok(LockHandle {
                key: key.to_string(),
                token,
                lock: self.clone(),
                released: false,
            });
        }
    }

    fn release(&self, key: &str, token: &str) {
        // Conditional delete: only the holder presenting the matching
        // token can release, so a stale release from an expired holder
        // can't clobber a newer legitimate acquisition.
        if let Some(entry) = self.entries.get(key) {
            if entry.token != token {
                return;
            }
        } else {
            return;
        }
        if let Some((_, state)) = self.entries.remove(key) {
            state.notify.notify_waiters();
        }
    }
}

/// Atomically insert a fresh entry for `key` if absent or expired, or
/// return the notifier to wait on if another holder still owns it.
fn notify_or_insert(
    entries: &DashMap<String, LockState>,
    key: &str,
    token: &str,
    ttl: Duration,
    now: Instant,
) -> Option<Arc<Notify>> {
    use dashmap::mapref::entry::Entry;
    match entries.entry(key.to_string()) {
        Entry::Occupied(mut occ) => {
            if occ.get().expires_at > now {
                Some(occ.get().notify.clone())
            } else {
                occ.insert(LockState {
                    token: token.to_string(),
                    expires_at: now + ttl,
                    notify: Arc::new(Notify::new()),
                });
                None
            }
        }
        Entry::Vacant(vac) => {
            vac.insert(LockState {
                token: token.to_string(),
                expires_at: now + ttl,
                notify: Arc::new(Notify::new()),
            });
            None
        }
    }
}

impl LockHandle {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.lock.release(&self.key, &self.token);
            self.released = true;
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let lock = DistributedLock::new();
        let handle = lock
            .acquire("node:1", Duration::from_millis(500), Duration::from_secs(10))
            .await
            .unwrap();

        let lock2 = lock.clone();
        let waiter = tokio::spawn(async move {
            lock2
                .acquire("node:1", Duration::from_millis(500), Duration::from_secs(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.release();

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn acquire_times_out_when_never_released() {
        let lock = DistributedLock::new();
        let _handle = lock
            .acquire("node:1", Duration::from_secs(10), Duration::from_secs(10))
            .await
            .unwrap();

        let result = lock
            .acquire("node:1", Duration::from_millis(50), Duration::from_secs(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable() {
        let lock = DistributedLock::new();
        let handle = lock
            .acquire("node:1", Duration::from_millis(500), Duration::from_millis(20))
            .await
            .unwrap();
        std::mem::forget(handle); // simulate a holder that never releases

        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = lock
            .acquire("node:1", Duration::from_millis(200), Duration::from_secs(10))
            .await;
        assert!(result.is_ok());
    }
}
