//! Best-effort distributed lock on top of [`SharedStore`].
//!
//! ```text
//! acquire(name, ttl) ── SET lock:<name> NX PX ttl ──┬─ written ──→ Acquired
//!                                                   ├─ exists  ──→ Denied
//!                                                   └─ error / timeout ──→ Unavailable
//! ```
//!
//! `Unavailable` means the shared store could not be asked. Callers decide
//! whether to proceed anyway; [`LockOutcome::may_proceed`] encodes the
//! gateway's availability-first policy.

use crate::store::SharedStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wattgate_core::{SharedClock, SystemClock};

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOutcome {
    /// This instance holds the lock.
    Acquired,
    /// Another holder has the lock.
    Denied,
    /// The shared store was unreachable or too slow to answer.
    Unavailable,
}

impl LockOutcome {
    /// Acquired, or unknown because the store is down.
    pub fn may_proceed(&self) -> bool {
        matches!(self, LockOutcome::Acquired | LockOutcome::Unavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Acquired => "acquired",
            LockOutcome::Denied => "denied",
            LockOutcome::Unavailable => "unavailable",
        }
    }
}

/// Distributed lock keyed as `lock:<name>`.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    /// Upper bound on any single store round trip.
    timeout: Duration,
    /// Identifies this process as lock holder.
    holder: String,
    /// Exact record written for each lock this instance currently holds.
    held: Arc<DashMap<String, String>>,
    clock: SharedClock,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn SharedStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            holder: Uuid::new_v4().to_string(),
            held: Arc::new(DashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(name: &str) -> String {
        format!("lock:{}", name)
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn record(&self) -> String {
        format!("{}:{}", self.holder, self.clock.now_millis())
    }

    /// Try once to take the lock for `ttl`. Never blocks longer than the
    /// configured timeout.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> LockOutcome {
        let key = Self::key(name);
        let record = self.record();
        let attempt = self.store.set_if_absent(&key, &record, ttl);
        let answer = tokio::time::timeout(self.timeout, attempt).await;
        match answer {
            Ok(Ok(true)) => {
                tracing::debug!(lock = %key, ttl_ms = ttl.as_millis() as u64, "lock acquired");
                self.held.insert(key, record);
                LockOutcome::Acquired
            }
            Ok(Ok(false)) => {
                tracing::debug!(lock = %key, "lock held elsewhere");
                LockOutcome::Denied
            }
            Ok(Err(e)) => {
                tracing::warn!(lock = %key, error = %e, "lock store unavailable, proceeding optimistically");
                LockOutcome::Unavailable
            }
            Err(_) => {
                tracing::warn!(
                    lock = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "lock store timed out, proceeding optimistically"
                );
                LockOutcome::Unavailable
            }
        }
    }

    /// Release the lock if this instance still holds it. The store deletes
    /// the key only while it carries the record this instance wrote, so a
    /// lock that expired and was re-taken elsewhere survives. Failures are
    /// logged and otherwise ignored; the TTL cleans up after us.
    pub async fn release(&self, name: &str) {
        let key = Self::key(name);
        let Some((_, record)) = self.held.remove(&key) else {
            tracing::debug!(lock = %key, "lock not held here, nothing to release");
            return;
        };
        let attempt = self.store.delete_if_equals(&key, &record);
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(true)) => tracing::debug!(lock = %key, "lock released"),
            Ok(Ok(false)) => tracing::debug!(lock = %key, "lock no longer ours, not releasing"),
            Ok(Err(e)) => tracing::warn!(lock = %key, error = %e, "lock release failed"),
            Err(_) => tracing::warn!(lock = %key, "lock release timed out"),
        }
    }

    /// Poll until `lock:<name>` is gone, at most `attempts` times.
    /// Returns `true` if the lock was observed free.
    pub async fn wait_until_free(&self, name: &str, attempts: u32, interval: Duration) -> bool {
        let key = Self::key(name);
        for _ in 0..attempts {
            tokio::time::sleep(interval).await;
            match tokio::time::timeout(self.timeout, self.store.get(&key)).await {
                Ok(Ok(None)) => return true,
                Ok(Ok(Some(_))) => continue,
                // Store trouble: stop waiting, the caller proceeds anyway.
                _ => return false,
            }
        }
        false
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("backend", &self.store.backend_name())
            .field("timeout", &self.timeout)
            .field("holder", &self.holder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use wattgate_core::{StoreError, StoreResult};

    struct DownStore;

    #[async_trait]
    impl SharedStore for DownStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unreachable {
                reason: "connection refused".to_string(),
            })
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unreachable {
                reason: "connection refused".to_string(),
            })
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> StoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn delete_if_equals(&self, _: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unreachable {
                reason: "connection refused".to_string(),
            })
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    struct HangingStore;

    #[async_trait]
    impl SharedStore for HangingStore {
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> StoreResult<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
        async fn get(&self, _: &str) -> StoreResult<Option<String>> {
            std::future::pending::<()>().await;
            Ok(None)
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> StoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn delete_if_equals(&self, _: &str, _: &str) -> StoreResult<bool> {
            std::future::pending::<()>().await;
            Ok(false)
        }
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_denied_until_release() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let a = DistributedLock::new(store.clone(), Duration::from_millis(500));
        let b = DistributedLock::new(store.clone(), Duration::from_millis(500));

        assert_eq!(a.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Acquired);
        assert_eq!(b.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Denied);

        // b cannot release a's lock.
        b.release("token_refresh").await;
        assert_eq!(b.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Denied);

        a.release("token_refresh").await;
        assert_eq!(b.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_release_keeps_lock_retaken_after_expiry() {
        let clock = Arc::new(wattgate_core::ManualClock::new(0));
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let a = DistributedLock::new(store.clone(), Duration::from_millis(500)).with_clock(clock.clone());
        let b = DistributedLock::new(store.clone(), Duration::from_millis(500)).with_clock(clock.clone());

        assert_eq!(a.acquire("token_refresh", Duration::from_secs(1)).await, LockOutcome::Acquired);
        clock.advance(Duration::from_millis(1_001));
        assert_eq!(b.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Acquired);

        // a's stale release must leave b's lock in place.
        a.release("token_refresh").await;
        let value = store.get("lock:token_refresh").await.unwrap().unwrap();
        assert!(value.starts_with(b.holder()));
        assert_eq!(a.acquire("token_refresh", Duration::from_secs(30)).await, LockOutcome::Denied);

        b.release("token_refresh").await;
        assert_eq!(store.get("lock:token_refresh").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let lock = DistributedLock::new(Arc::new(DownStore), Duration::from_millis(500));
        let outcome = lock.acquire("token_refresh", Duration::from_secs(30)).await;
        assert_eq!(outcome, LockOutcome::Unavailable);
        assert!(outcome.may_proceed());
        assert!(!LockOutcome::Denied.may_proceed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let lock = DistributedLock::new(Arc::new(HangingStore), Duration::from_millis(500));
        let outcome = lock.acquire("token_refresh", Duration::from_secs(30)).await;
        assert_eq!(outcome, LockOutcome::Unavailable);
        // Release must not hang either.
        lock.release("token_refresh").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_free_observes_release() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let holder = DistributedLock::new(store.clone(), Duration::from_millis(500));
        let waiter = DistributedLock::new(store.clone(), Duration::from_millis(500));
        holder.acquire("token_refresh", Duration::from_secs(30)).await;

        assert!(!waiter.wait_until_free("token_refresh", 2, Duration::from_millis(10)).await);
        holder.release("token_refresh").await;
        assert!(waiter.wait_until_free("token_refresh", 2, Duration::from_millis(10)).await);
    }
}
