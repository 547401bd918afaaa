//! Shared key-value store used for cross-instance coordination.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::sync::Arc;
use std::time::Duration;
use wattgate_core::{SharedClock, StoreError, StoreResult, SystemClock};

/// Minimal string key-value contract shared by every gateway instance.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically store `value` under `key` with a TTL unless the key exists.
    /// Returns `true` when the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically delete `key` only while it still holds `expected`.
    /// Returns `true` when the key was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reachability probe used by the readiness check.
    async fn ping(&self) -> StoreResult<()>;

    /// Backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<i64>,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms.map_or(true, |exp| exp > now)
    }
}

/// Process-local store. Only correct for a single gateway instance.
#[derive(Clone)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    clock: SharedClock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| {
            self.clock
                .now_millis()
                .saturating_add(i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX))
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at_ms: self.expiry(Some(ttl)),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(stored);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_millis();
        let live = self
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && entry.value == expected);
        Ok(removed.is_some())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// REDIS STORE
// ============================================================================

/// Redis-backed store shared by all gateway instances.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (for example `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend {
            reason: format!("invalid redis url: {}", e),
        })?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(redis_error)?;
        Ok(Self { conn })
    }
}

/// GET and DEL in one server-side step so no other writer slips in between.
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

fn redis_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout { timeout_ms: 0 }
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Unreachable {
            reason: err.to_string(),
        }
    } else {
        StoreError::Backend {
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // SET NX answers "OK" when written and nil when the key already exists.
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(written.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(redis_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(redis_error)?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattgate_core::ManualClock;

    #[tokio::test]
    async fn test_set_if_absent_respects_existing_key() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("lock:a", "1", Duration::from_secs(30)).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "2", Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_expired_key_can_be_reacquired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryStore::with_clock(clock.clone());
        assert!(store.set_if_absent("lock:a", "1", Duration::from_secs(1)).await.unwrap());
        clock.advance(Duration::from_millis(1_001));
        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(store.set_if_absent("lock:a", "2", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_without_ttl_and_delete() {
        let store = InMemoryStore::new();
        store.set("session:s1:customer", "c-1", None).await.unwrap();
        assert_eq!(
            store.get("session:s1:customer").await.unwrap().as_deref(),
            Some("c-1")
        );
        store.delete("session:s1:customer").await.unwrap();
        assert_eq!(store.get("session:s1:customer").await.unwrap(), None);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_if_equals_only_removes_matching_value() {
        let store = InMemoryStore::new();
        store.set("lock:a", "holder-1:0", None).await.unwrap();
        assert!(!store.delete_if_equals("lock:a", "holder-2:0").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("holder-1:0"));
        assert!(store.delete_if_equals("lock:a", "holder-1:0").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(!store.delete_if_equals("lock:a", "holder-1:0").await.unwrap());
    }
}
