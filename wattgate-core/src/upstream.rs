//! Upstream provider contract.
//!
//! Implementations report non-success answers as [`UpstreamFailure`] values
//! (status plus body) rather than errors, so the retry executor can decide
//! whether to try again and the gateway can pass the status through.

use crate::error::GatewayError;
use crate::types::{Aggregation, LookupScope};
use crate::DateRange;
use async_trait::async_trait;
use serde_json::Value;

/// Status used for transport failures (connect, timeout, malformed body).
pub const TRANSPORT_FAILURE_STATUS: u16 = 503;

/// A non-success answer from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub status: u16,
    pub body: String,
    /// Raw `Retry-After` header value, if the provider sent one.
    pub retry_after: Option<String>,
}

impl UpstreamFailure {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<String>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(TRANSPORT_FAILURE_STATUS, reason)
    }

    /// 429 and 503 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 429 | 503)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream status {}", self.status)
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(failure: UpstreamFailure) -> Self {
        if failure.is_rate_limited() {
            GatewayError::UpstreamRateLimited {
                retry_after: failure.retry_after,
                body: failure.body,
            }
        } else {
            GatewayError::Upstream {
                status: failure.status,
                body: failure.body,
            }
        }
    }
}

/// Result type for a single upstream call.
pub type UpstreamResult<T> = Result<T, UpstreamFailure>;

/// The third-party data provider.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Exchange the refresh credential for an access token payload.
    async fn fetch_access_token(&self, refresh_token: &str) -> UpstreamResult<Value>;

    /// All authorizations granted to this third party.
    async fn list_authorizations(&self, access_token: &str) -> UpstreamResult<Value>;

    /// Metering point ids reachable through `identifier`.
    async fn metering_point_ids(
        &self,
        access_token: &str,
        scope: LookupScope,
        identifier: &str,
    ) -> UpstreamResult<Value>;

    /// Time series for `metering_point_ids` over `range`.
    async fn time_series(
        &self,
        access_token: &str,
        range: DateRange,
        aggregation: Aggregation,
        metering_point_ids: &[String],
    ) -> UpstreamResult<Value>;
}
