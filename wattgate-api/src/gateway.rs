//! Gateway orchestration.
//!
//! Each operation obtains an access token, resolves identifiers, consults the
//! per-process caches and only then calls the provider through the retry
//! executor. Identical concurrent work is coalesced.
//!
//! Consumption fetch:
//! `ObtainToken → ResolveMeteringPoints → CheckCache (hit ⇒ done) →
//! FetchConsumption (retry loop) → Aggregate → StoreCache`.

use chrono::{FixedOffset, Local, NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use wattgate_core::{
    clamp_date_range, total_consumption, AccessError, AccessToken, Aggregation, ConsumptionQuery,
    GatewayError, GatewayResult, LookupScope, SharedClock, UpstreamApi, UpstreamResult,
};
use wattgate_storage::BoundedCache;

use crate::resilience::{RequestCoalescer, RetryExecutor};
use crate::telemetry::metrics;
use crate::token::TokenManager;

const AUTHORIZATIONS_KEY: &str = "authorizations";

/// Fields of an authorization entry that may carry the customer identity.
const IDENTITY_FIELDS: &[&str] = &["id", "customerCVR", "customerKey"];

/// Cache sizes and lifetimes, plus the zone used for date clamping.
#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub consumption_cache_ttl: Duration,
    pub consumption_cache_max: usize,
    pub metering_cache_ttl: Duration,
    pub metering_cache_max: usize,
    pub authorizations_cache_ttl: Duration,
    pub coalesce_grace: Duration,
    /// Offset that defines "yesterday" for date clamping. `None` uses the
    /// host's local zone.
    pub utc_offset: Option<FixedOffset>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            consumption_cache_ttl: Duration::from_secs(300),
            consumption_cache_max: 500,
            metering_cache_ttl: Duration::from_secs(3600),
            metering_cache_max: 1000,
            authorizations_cache_ttl: Duration::from_secs(60),
            coalesce_grace: Duration::from_millis(100),
            utc_offset: None,
        }
    }
}

/// Parameters of a consumption request after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionParams {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub aggregation: Aggregation,
    /// Caller-supplied ids; empty means resolve from the identity.
    pub metering_point_ids: Vec<String>,
}

/// The gateway service. Cheap to clone; clones share caches and in-flight work.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    upstream: Arc<dyn UpstreamApi>,
    tokens: TokenManager,
    retry: RetryExecutor,
    settings: GatewaySettings,
    consumption_cache: BoundedCache<String, Value>,
    metering_cache: BoundedCache<String, Vec<String>>,
    authorizations_cache: BoundedCache<String, Value>,
    consumption_flights: RequestCoalescer<Value>,
    metering_flights: RequestCoalescer<Vec<String>>,
    authorization_flights: RequestCoalescer<Value>,
    clock: SharedClock,
}

impl Gateway {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        tokens: TokenManager,
        retry: RetryExecutor,
        settings: GatewaySettings,
        clock: SharedClock,
    ) -> Self {
        let grace = settings.coalesce_grace;
        Self {
            inner: Arc::new(Inner {
                upstream,
                tokens,
                retry,
                settings,
                consumption_cache: BoundedCache::with_clock(
                    settings.consumption_cache_max,
                    settings.consumption_cache_ttl,
                    clock.clone(),
                ),
                metering_cache: BoundedCache::with_clock(
                    settings.metering_cache_max,
                    settings.metering_cache_ttl,
                    clock.clone(),
                ),
                authorizations_cache: BoundedCache::with_clock(
                    1,
                    settings.authorizations_cache_ttl,
                    clock.clone(),
                ),
                consumption_flights: RequestCoalescer::new("consumption", grace),
                metering_flights: RequestCoalescer::new("metering_points", grace),
                authorization_flights: RequestCoalescer::new(AUTHORIZATIONS_KEY, grace),
                clock,
            }),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    // ========================================================================
    // Authorizations
    // ========================================================================

    /// Authorizations belonging to `customer_id`, filtered from the full list
    /// the third party can see.
    pub async fn list_authorizations(&self, customer_id: &str) -> GatewayResult<Value> {
        let payload = self.all_authorizations().await?;
        let matching: Vec<Value> = entries(&payload)
            .filter(|entry| {
                IDENTITY_FIELDS.iter().any(|field| {
                    entry.get(field).and_then(Value::as_str).map(str::trim) == Some(customer_id)
                })
            })
            .cloned()
            .collect();

        if matching.is_empty() {
            return Err(GatewayError::not_found("no matching authorization"));
        }
        Ok(json!({ "customerId": customer_id, "result": matching }))
    }

    async fn all_authorizations(&self) -> GatewayResult<Value> {
        let key = AUTHORIZATIONS_KEY.to_string();
        if let Some(hit) = self.cached(&self.inner.authorizations_cache, "authorizations", &key) {
            return Ok(hit);
        }
        let gateway = self.clone();
        self.inner
            .authorization_flights
            .run(AUTHORIZATIONS_KEY, move || async move {
                let token = gateway.inner.tokens.access_token().await?;
                let payload = gateway
                    .call_upstream("authorizations", |_| {
                        gateway.inner.upstream.list_authorizations(token.expose())
                    })
                    .await?;
                gateway.inner.authorizations_cache.set(key, payload.clone());
                Ok(payload)
            })
            .await
    }

    // ========================================================================
    // Metering points
    // ========================================================================

    /// Metering point ids for `identifier`, cached per scope and identity.
    /// An empty result is `NotFound`.
    pub async fn metering_points(
        &self,
        scope: LookupScope,
        identifier: &str,
    ) -> GatewayResult<Vec<String>> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(GatewayError::missing("identifier"));
        }
        let key = format!("meteringpoints:{}:{}", scope, identifier);
        if let Some(hit) = self.cached(&self.inner.metering_cache, "metering_points", &key) {
            return Ok(hit);
        }

        let gateway = self.clone();
        let identifier = identifier.to_string();
        let cache_key = key.clone();
        self.inner
            .metering_flights
            .run(&key, move || async move {
                let token = gateway.inner.tokens.access_token().await?;
                let payload = gateway
                    .call_upstream("metering_point_ids", |_| {
                        gateway
                            .inner
                            .upstream
                            .metering_point_ids(token.expose(), scope, &identifier)
                    })
                    .await?;
                let ids = parse_metering_point_ids(&payload);
                if ids.is_empty() {
                    tracing::info!(scope = %scope, "no metering points resolved");
                    return Err(GatewayError::not_found("no metering points found"));
                }
                gateway.inner.metering_cache.set(cache_key, ids.clone());
                Ok(ids)
            })
            .await
    }

    // ========================================================================
    // Consumption
    // ========================================================================

    /// Consumption for the session's bound customer. Supplied metering point
    /// ids must all belong to that customer.
    pub async fn consumption(
        &self,
        customer_id: &str,
        params: ConsumptionParams,
    ) -> GatewayResult<Value> {
        let scope = LookupScope::for_identity(customer_id);
        let token = self.inner.tokens.access_token().await?;

        let owned = self.metering_points(scope, customer_id).await?;
        let ids = if params.metering_point_ids.is_empty() {
            owned
        } else {
            let owned: HashSet<&str> = owned.iter().map(String::as_str).collect();
            if let Some(foreign) = params
                .metering_point_ids
                .iter()
                .find(|id| !owned.contains(id.as_str()))
            {
                tracing::warn!(metering_point = %foreign, "metering point not owned by session customer");
                return Err(AccessError::CustomerMismatch.into());
            }
            params.metering_point_ids.clone()
        };

        self.fetch_consumption(customer_id, scope, ids, &params, token)
            .await
    }

    /// Unauthenticated consumption lookup. Supplied ids are used as given;
    /// otherwise `identifier` is resolved with `scope` (or its inferred scope).
    pub async fn direct_consumption(
        &self,
        identifier: Option<&str>,
        scope: Option<LookupScope>,
        params: ConsumptionParams,
    ) -> GatewayResult<Value> {
        let identifier = identifier.map(str::trim).filter(|s| !s.is_empty());
        let token = self.inner.tokens.access_token().await?;

        let (identity, scope, ids) = match identifier {
            Some(identity) => {
                let scope = scope.unwrap_or_else(|| LookupScope::for_identity(identity));
                let ids = if params.metering_point_ids.is_empty() {
                    self.metering_points(scope, identity).await?
                } else {
                    params.metering_point_ids.clone()
                };
                (identity, scope, ids)
            }
            None if !params.metering_point_ids.is_empty() => (
                "",
                scope.unwrap_or(LookupScope::CustomerCvr),
                params.metering_point_ids.clone(),
            ),
            None => return Err(GatewayError::missing("identifier")),
        };

        self.fetch_consumption(identity, scope, ids, &params, token)
            .await
    }

    async fn fetch_consumption(
        &self,
        identity: &str,
        scope: LookupScope,
        metering_point_ids: Vec<String>,
        params: &ConsumptionParams,
        token: AccessToken,
    ) -> GatewayResult<Value> {
        let query = ConsumptionQuery {
            identifier: identity.to_string(),
            scope,
            range: clamp_date_range(params.date_from, params.date_to, self.local_now()),
            aggregation: params.aggregation,
            metering_point_ids,
        };
        let key = query.cache_key();
        if let Some(hit) = self.cached(&self.inner.consumption_cache, "consumption", &key) {
            return Ok(hit);
        }

        let gateway = self.clone();
        let cache_key = key.clone();
        self.inner
            .consumption_flights
            .run(&key, move || async move {
                let payload = gateway
                    .call_upstream("time_series", |_| {
                        gateway.inner.upstream.time_series(
                            token.expose(),
                            query.range,
                            query.aggregation,
                            &query.metering_point_ids,
                        )
                    })
                    .await?;

                let total = total_consumption(&payload);
                let response = json!({
                    "customerId": query.identifier,
                    "dateFrom": query.range.from.to_string(),
                    "dateTo": query.range.to.to_string(),
                    "aggregation": query.aggregation,
                    "meteringPointIds": query.metering_point_ids,
                    "totalConsumption": total,
                    "result": payload.get("result").cloned().unwrap_or(payload),
                });
                gateway
                    .inner
                    .consumption_cache
                    .set(cache_key, response.clone());
                tracing::info!(
                    metering_points = query.metering_point_ids.len(),
                    date_from = %query.range.from,
                    date_to = %query.range.to,
                    aggregation = %query.aggregation,
                    total_consumption = total,
                    "consumption fetched"
                );
                Ok(response)
            })
            .await
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Current access token and its expiry.
    pub async fn token(&self) -> GatewayResult<Value> {
        let token = self.inner.tokens.access_token().await?;
        Ok(json!({
            "token": token.expose(),
            "expiresAt": token.expires_at_ms,
        }))
    }

    /// Check that the refresh credential works end to end.
    pub async fn test_auth(&self) -> GatewayResult<Value> {
        let token = self.inner.tokens.access_token().await?;
        let payload = self.all_authorizations().await?;
        Ok(json!({
            "ok": true,
            "tokenExpiresAt": token.expires_at_ms,
            "authorizations": entries(&payload).count(),
        }))
    }

    /// Non-secret view of the service's settings and cache state.
    pub fn config_report(&self) -> Value {
        let retry = self.inner.retry.policy();
        let settings = &self.inner.settings;
        json!({
            "refreshTokenConfigured": self.inner.tokens.has_refresh_token(),
            "retry": {
                "maxAttempts": retry.max_attempts,
                "baseDelayMs": retry.base_delay.as_millis() as u64,
            },
            "caches": {
                "consumption": {
                    "ttlSecs": settings.consumption_cache_ttl.as_secs(),
                    "stats": self.inner.consumption_cache.stats(),
                },
                "meteringPoints": {
                    "ttlSecs": settings.metering_cache_ttl.as_secs(),
                    "stats": self.inner.metering_cache.stats(),
                },
                "authorizations": {
                    "ttlSecs": settings.authorizations_cache_ttl.as_secs(),
                    "stats": self.inner.authorizations_cache.stats(),
                },
            },
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn local_now(&self) -> NaiveDateTime {
        let now = self.inner.clock.now();
        match self.inner.settings.utc_offset {
            Some(offset) => now.with_timezone(&offset).naive_local(),
            None => now.with_timezone(&Local).naive_local(),
        }
    }

    fn cached<V: Clone>(
        &self,
        cache: &BoundedCache<String, V>,
        name: &str,
        key: &String,
    ) -> Option<V> {
        let hit = cache.get(key);
        if let Some(m) = metrics() {
            m.record_cache_lookup(name, hit.is_some());
        }
        hit
    }

    /// Run an upstream call through the retry executor. A 401 means the
    /// provider no longer accepts our token, so it is dropped.
    async fn call_upstream<T, F, Fut>(&self, endpoint: &str, operation: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        self.inner
            .retry
            .execute(endpoint, operation)
            .await
            .map_err(|failure| {
                if failure.status == 401 {
                    self.inner.tokens.invalidate();
                }
                tracing::warn!(endpoint = endpoint, status = failure.status, "upstream call failed");
                failure.into()
            })
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("settings", &self.inner.settings)
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

/// Entries of a `{"result": [...]}` payload, or of a bare array.
fn entries(payload: &Value) -> impl Iterator<Item = &Value> {
    payload
        .get("result")
        .unwrap_or(payload)
        .as_array()
        .map(|arr| arr.iter())
        .into_iter()
        .flatten()
}

/// Accepts plain string ids and objects carrying `meteringPointId`.
fn parse_metering_point_ids(payload: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    entries(payload)
        .filter_map(|entry| match entry {
            Value::String(id) => Some(id.as_str()),
            Value::Object(_) => entry.get("meteringPointId").and_then(Value::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}
