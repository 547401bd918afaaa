//! wattgate Test Utilities
//!
//! Shared test infrastructure for the wattgate workspace:
//! - A scriptable, call-counting fake of the upstream provider
//! - A shared store that is always unreachable
//! - Session token and payload fixtures
//! - Proptest generators for identities and query parameters

pub use wattgate_core::{
    Aggregation, Clock, GatewayError, LookupScope, ManualClock, SigningKey, UpstreamApi,
    UpstreamFailure, UpstreamResult,
};
pub use wattgate_storage::{InMemoryStore, SharedStore};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use wattgate_core::{DateRange, StoreError, StoreResult};

// ============================================================================
// FAKE UPSTREAM
// ============================================================================

/// Scripted answers for one endpoint: queued results first, then the default.
struct Script {
    queued: Mutex<VecDeque<UpstreamResult<Value>>>,
    default: Mutex<UpstreamResult<Value>>,
    calls: AtomicUsize,
}

impl Script {
    fn new(default: Value) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(default)),
            calls: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> UpstreamResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.queued.lock().unwrap().pop_front() {
            return next;
        }
        self.default.lock().unwrap().clone()
    }

    fn set_default(&self, result: UpstreamResult<Value>) {
        *self.default.lock().unwrap() = result;
    }

    fn push(&self, result: UpstreamResult<Value>) {
        self.queued.lock().unwrap().push_back(result);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// In-process stand-in for the provider API.
///
/// Every endpoint answers with its queued results in order and then falls
/// back to a default. Each call is counted, and an optional delay keeps calls
/// in flight long enough for concurrency tests.
pub struct FakeUpstream {
    token: Script,
    authorizations: Script,
    metering_points: Script,
    time_series: Script,
    delay: Mutex<Duration>,
    last_time_series_ids: Mutex<Vec<String>>,
    last_lookup: Mutex<Option<(LookupScope, String)>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self {
            token: Script::new(fixtures::token_payload("fake-access-token")),
            authorizations: Script::new(fixtures::authorizations_payload(&[])),
            metering_points: Script::new(fixtures::metering_points_payload(&[])),
            time_series: Script::new(fixtures::time_series_payload(&[])),
            delay: Mutex::new(Duration::ZERO),
            last_time_series_ids: Mutex::new(Vec::new()),
            last_lookup: Mutex::new(None),
        }
    }

    pub fn with_token(self, payload: Value) -> Self {
        self.token.set_default(Ok(payload));
        self
    }

    pub fn with_authorizations(self, payload: Value) -> Self {
        self.authorizations.set_default(Ok(payload));
        self
    }

    pub fn with_metering_points(self, payload: Value) -> Self {
        self.metering_points.set_default(Ok(payload));
        self
    }

    pub fn with_time_series(self, payload: Value) -> Self {
        self.time_series.set_default(Ok(payload));
        self
    }

    /// Delay applied to every call before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn push_token(&self, result: UpstreamResult<Value>) {
        self.token.push(result);
    }

    pub fn push_authorizations(&self, result: UpstreamResult<Value>) {
        self.authorizations.push(result);
    }

    pub fn push_metering_points(&self, result: UpstreamResult<Value>) {
        self.metering_points.push(result);
    }

    pub fn push_time_series(&self, result: UpstreamResult<Value>) {
        self.time_series.push(result);
    }

    pub fn token_calls(&self) -> usize {
        self.token.calls()
    }

    pub fn authorization_calls(&self) -> usize {
        self.authorizations.calls()
    }

    pub fn metering_point_calls(&self) -> usize {
        self.metering_points.calls()
    }

    pub fn time_series_calls(&self) -> usize {
        self.time_series.calls()
    }

    /// Calls across every endpoint.
    pub fn total_calls(&self) -> usize {
        self.token_calls()
            + self.authorization_calls()
            + self.metering_point_calls()
            + self.time_series_calls()
    }

    pub fn last_time_series_ids(&self) -> Vec<String> {
        self.last_time_series_ids.lock().unwrap().clone()
    }

    pub fn last_lookup(&self) -> Option<(LookupScope, String)> {
        self.last_lookup.lock().unwrap().clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for FakeUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn fetch_access_token(&self, _refresh_token: &str) -> UpstreamResult<Value> {
        let result = self.token.next();
        self.pause().await;
        result
    }

    async fn list_authorizations(&self, _access_token: &str) -> UpstreamResult<Value> {
        let result = self.authorizations.next();
        self.pause().await;
        result
    }

    async fn metering_point_ids(
        &self,
        _access_token: &str,
        scope: LookupScope,
        identifier: &str,
    ) -> UpstreamResult<Value> {
        *self.last_lookup.lock().unwrap() = Some((scope, identifier.to_string()));
        let result = self.metering_points.next();
        self.pause().await;
        result
    }

    async fn time_series(
        &self,
        _access_token: &str,
        _range: DateRange,
        _aggregation: Aggregation,
        metering_point_ids: &[String],
    ) -> UpstreamResult<Value> {
        *self.last_time_series_ids.lock().unwrap() = metering_point_ids.to_vec();
        let result = self.time_series.next();
        self.pause().await;
        result
    }
}

// ============================================================================
// UNREACHABLE STORE
// ============================================================================

/// Shared store whose every call fails as if the backend were down.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreachableStore;

fn unreachable<T>() -> StoreResult<T> {
    Err(StoreError::Unreachable {
        reason: "connection refused".to_string(),
    })
}

#[async_trait]
impl SharedStore for UnreachableStore {
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        unreachable()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        unreachable()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        unreachable()
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        unreachable()
    }

    async fn delete_if_equals(&self, _key: &str, _expected: &str) -> StoreResult<bool> {
        unreachable()
    }

    async fn ping(&self) -> StoreResult<()> {
        unreachable()
    }

    fn backend_name(&self) -> &'static str {
        "unreachable"
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    /// Session secret used throughout the test suites.
    pub const TEST_SESSION_SECRET: &str = "wattgate-test-session-secret-0123456789abcdef";

    pub const TEST_CVR: &str = "12345678";
    pub const TEST_AUTHORIZATION_ID: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

    pub fn signing_key() -> SigningKey {
        SigningKey::from_config(TEST_SESSION_SECRET).expect("test secret should be valid")
    }

    /// A session token that never expires.
    pub fn session_token(session_id: &str) -> String {
        signing_key()
            .issue_session(session_id, None)
            .expect("signing should succeed")
    }

    /// A session token that expired at `expired_at_ms`.
    pub fn expired_session_token(session_id: &str, expired_at_ms: i64) -> String {
        signing_key()
            .issue_session(session_id, Some(expired_at_ms))
            .expect("signing should succeed")
    }

    pub fn token_payload(token: &str) -> Value {
        json!({ "result": token })
    }

    pub fn authorization(id: &str, cvr: &str, name: &str) -> Value {
        json!({
            "id": id,
            "thirdPartyName": "wattgate",
            "validFrom": "2025-01-01T00:00:00",
            "validTo": "2026-01-01T00:00:00",
            "customerName": name,
            "customerCVR": cvr,
            "customerKey": format!("key-{}", cvr),
            "includeFutureMeteringPoints": true,
            "timeStamp": "2025-01-01T00:00:00"
        })
    }

    pub fn authorizations_payload(entries: &[Value]) -> Value {
        json!({ "result": entries })
    }

    pub fn metering_points_payload(ids: &[&str]) -> Value {
        json!({ "result": ids })
    }

    /// Time-series payload with one document per metering point, each carrying
    /// one period with the given point quantities.
    pub fn time_series_payload(points: &[(&str, &[&str])]) -> Value {
        let result: Vec<Value> = points
            .iter()
            .map(|(mp, quantities)| {
                let points: Vec<Value> = quantities
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        json!({
                            "position": (i + 1).to_string(),
                            "out_Quantity.quantity": q,
                            "out_Quantity.quality": "A04"
                        })
                    })
                    .collect();
                json!({
                    "success": true,
                    "id": mp,
                    "MyEnergyData_MarketDocument": {
                        "mRID": uuid::Uuid::new_v4().to_string(),
                        "TimeSeries": [{
                            "mRID": mp,
                            "measurement_Unit.name": "KWH",
                            "Period": [{
                                "resolution": "P1D",
                                "Point": points
                            }]
                        }]
                    }
                })
            })
            .collect();
        json!({ "result": result })
    }

    pub fn rate_limited(retry_after: Option<&str>) -> UpstreamFailure {
        UpstreamFailure::new(429, "Too Many Requests")
            .with_retry_after(retry_after.map(str::to_string))
    }

    pub fn unavailable() -> UpstreamFailure {
        UpstreamFailure::new(503, "Service Unavailable")
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    /// 8-digit CVR numbers.
    pub fn arb_cvr() -> impl Strategy<Value = String> {
        "[1-9][0-9]{7}"
    }

    /// GUID-shaped authorization ids.
    pub fn arb_authorization_id() -> impl Strategy<Value = String> {
        any::<u128>().prop_map(|n| uuid::Uuid::from_u128(n).to_string())
    }

    /// Either kind of customer identity.
    pub fn arb_customer_id() -> impl Strategy<Value = String> {
        prop_oneof![arb_cvr(), arb_authorization_id()]
    }

    /// 18-digit metering point ids.
    pub fn arb_metering_point_id() -> impl Strategy<Value = String> {
        "5713[0-9]{14}"
    }

    pub fn arb_aggregation() -> impl Strategy<Value = Aggregation> {
        prop_oneof![
            Just(Aggregation::Hour),
            Just(Aggregation::Day),
            Just(Aggregation::Month),
            Just(Aggregation::Year),
        ]
    }

    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (2020i32..2030, 1u32..=12, 1u32..=28)
            .prop_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_upstream_scripts_then_defaults() {
        let upstream = FakeUpstream::new();
        upstream.push_time_series(Err(fixtures::rate_limited(Some("5"))));

        let first = upstream
            .time_series("t", dummy_range(), Aggregation::Day, &["a".to_string()])
            .await;
        assert_eq!(first.unwrap_err().status, 429);
        let second = upstream
            .time_series("t", dummy_range(), Aggregation::Day, &["b".to_string()])
            .await;
        assert!(second.is_ok());
        assert_eq!(upstream.time_series_calls(), 2);
        assert_eq!(upstream.last_time_series_ids(), vec!["b".to_string()]);
        assert_eq!(upstream.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_everything() {
        let store = UnreachableStore;
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());
    }

    #[test]
    fn test_session_fixture_verifies() {
        let clock = ManualClock::new(0);
        let claims = fixtures::signing_key()
            .verify(&fixtures::session_token("s-1"), &clock)
            .unwrap();
        assert_eq!(claims.session_id, "s-1");
    }

    fn dummy_range() -> DateRange {
        let day = chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        DateRange { from: day, to: day }
    }
}
