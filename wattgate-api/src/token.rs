//! Upstream access token management.
//!
//! Access tokens are exchanged for the long-lived refresh credential and
//! cached in-process until they get close to expiry. A refresh is coalesced
//! within the process and guarded across instances by the `token_refresh`
//! distributed lock.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wattgate_core::{
    AccessToken, ConfigError, GatewayError, GatewayResult, SharedClock, UpstreamApi,
    UpstreamFailure,
};
use wattgate_storage::{BoundedCache, DistributedLock, LockOutcome};

use crate::resilience::{RequestCoalescer, RetryExecutor};
use crate::telemetry::metrics;

/// Coalescing key and lock name for refreshes.
pub const TOKEN_REFRESH_KEY: &str = "token_refresh";

const CACHE_KEY: &str = "access_token";

/// Response fields that may carry the access token, in lookup order.
const TOKEN_FIELDS: &[&str] = &["result", "access_token", "token"];

/// Polls of a lock held by another instance before refreshing anyway.
const DENIED_POLL_ATTEMPTS: u32 = 10;
const DENIED_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Tunables for [`TokenManager`].
#[derive(Debug, Clone, Copy)]
pub struct TokenSettings {
    /// Validity assigned to a freshly issued token.
    pub lifetime: Duration,
    /// Cached tokens with less time left are refreshed.
    pub min_validity: Duration,
    pub lock_ttl: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(20 * 60),
            min_validity: Duration::from_secs(15),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

/// Hands out upstream access tokens. Cheap to clone.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    upstream: Arc<dyn UpstreamApi>,
    refresh_token: Option<SecretString>,
    cache: BoundedCache<String, AccessToken>,
    coalescer: RequestCoalescer<AccessToken>,
    lock: DistributedLock,
    retry: RetryExecutor,
    settings: TokenSettings,
    clock: SharedClock,
}

impl TokenManager {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        refresh_token: Option<SecretString>,
        lock: DistributedLock,
        retry: RetryExecutor,
        settings: TokenSettings,
        coalesce_grace: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                refresh_token,
                cache: BoundedCache::with_clock(1, settings.lifetime, clock.clone()),
                coalescer: RequestCoalescer::new(TOKEN_REFRESH_KEY, coalesce_grace),
                lock,
                retry,
                settings,
                clock,
            }),
        }
    }

    /// A token with at least `min_validity` left, refreshing if needed.
    pub async fn access_token(&self) -> GatewayResult<AccessToken> {
        if let Some(token) = self.inner.cached() {
            return Ok(token);
        }
        let refresh_token =
            self.inner
                .refresh_token
                .clone()
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: "WATTGATE_REFRESH_TOKEN".to_string(),
                })?;

        let inner = Arc::clone(&self.inner);
        self.inner
            .coalescer
            .run(TOKEN_REFRESH_KEY, move || async move {
                inner.refresh_under_lock(&refresh_token).await
            })
            .await
    }

    /// Drop the cached token, e.g. after the provider rejected it. A refresh
    /// that already settled is forgotten too, so the next caller does not
    /// get the rejected token back from the coalescer.
    pub fn invalidate(&self) {
        let cached = self.inner.cache.remove(&CACHE_KEY.to_string()).is_some();
        let settled = self.inner.coalescer.forget(TOKEN_REFRESH_KEY);
        if cached || settled {
            tracing::info!("cached access token invalidated");
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.inner.refresh_token.is_some()
    }
}

impl Inner {
    fn cached(&self) -> Option<AccessToken> {
        let token = self.cache.get(&CACHE_KEY.to_string());
        let hit = token.as_ref().is_some_and(|t| {
            t.remaining_validity(self.clock.now_millis()) >= self.settings.min_validity
        });
        if let Some(m) = metrics() {
            m.record_cache_lookup("access_token", hit);
        }
        token.filter(|_| hit)
    }

    async fn refresh_under_lock(&self, refresh_token: &SecretString) -> GatewayResult<AccessToken> {
        let outcome = self
            .lock
            .acquire(TOKEN_REFRESH_KEY, self.settings.lock_ttl)
            .await;
        if let Some(m) = metrics() {
            m.record_lock(TOKEN_REFRESH_KEY, outcome.as_str());
        }

        if outcome.may_proceed() {
            if outcome == LockOutcome::Unavailable {
                tracing::warn!("refreshing access token without cross-instance lock");
            }
            let result = self.refresh(refresh_token).await;
            if outcome == LockOutcome::Acquired {
                self.lock.release(TOKEN_REFRESH_KEY).await;
            }
            return result;
        }

        let freed = self
            .lock
            .wait_until_free(TOKEN_REFRESH_KEY, DENIED_POLL_ATTEMPTS, DENIED_POLL_INTERVAL)
            .await;
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        // The other instance's token lives in its own cache, not ours.
        tracing::debug!(lock_freed = freed, "refreshing after waiting on another instance");
        self.refresh(refresh_token).await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> GatewayResult<AccessToken> {
        let result = self
            .retry
            .execute("token", |_| {
                self.upstream
                    .fetch_access_token(refresh_token.expose_secret())
            })
            .await;

        let token = result
            .map_err(token_failure)
            .and_then(|payload| {
                extract_token(&payload).ok_or_else(|| GatewayError::UpstreamToken {
                    reason: "token response had no recognizable token field".to_string(),
                })
            })
            .map(|value| {
                let lifetime_ms = i64::try_from(self.settings.lifetime.as_millis()).unwrap_or(i64::MAX);
                AccessToken::new(value, self.clock.now_millis().saturating_add(lifetime_ms))
            });

        if let Some(m) = metrics() {
            m.record_token_refresh(token.is_ok());
        }
        match &token {
            Ok(token) => {
                self.cache
                    .set_with_ttl(CACHE_KEY.to_string(), token.clone(), self.settings.lifetime);
                tracing::info!(expires_at_ms = token.expires_at_ms, "access token refreshed");
            }
            Err(e) => tracing::error!(error = %e, "access token refresh failed"),
        }
        token
    }
}

/// Rate limiting keeps its identity so callers see 429; everything else is a
/// token error.
fn token_failure(failure: UpstreamFailure) -> GatewayError {
    if failure.is_rate_limited() {
        return failure.into();
    }
    GatewayError::UpstreamToken {
        reason: format!("token endpoint responded with {}", failure.status),
    }
}

/// Pull the token out of whichever field the provider used.
fn extract_token(payload: &Value) -> Option<String> {
    if let Some(raw) = payload.as_str() {
        return Some(raw.trim().to_string()).filter(|t| !t.is_empty());
    }
    TOKEN_FIELDS
        .iter()
        .filter_map(|field| payload.get(field).and_then(Value::as_str))
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("refresh_token", &self.inner.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
