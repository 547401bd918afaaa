//! Domain types for consumption queries and upstream credentials.

use crate::error::GatewayError;
use crate::DateRange;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

static GUID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").ok()
});

/// Upstream customer identity bound to a session.
pub type CustomerId = String;

// ============================================================================
// AGGREGATION
// ============================================================================

/// Time-series granularity accepted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Aggregation {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Hour => "Hour",
            Aggregation::Day => "Day",
            Aggregation::Month => "Month",
            Aggregation::Year => "Year",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(Aggregation::Hour),
            "day" => Ok(Aggregation::Day),
            "month" => Ok(Aggregation::Month),
            "year" => Ok(Aggregation::Year),
            other => Err(GatewayError::bad_request(format!(
                "aggregation must be one of Hour, Day, Month, Year (got '{}')",
                other
            ))),
        }
    }
}

// ============================================================================
// LOOKUP SCOPE
// ============================================================================

/// How an identity is looked up at the metering-point endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookupScope {
    #[serde(rename = "authorizationId")]
    AuthorizationId,
    #[serde(rename = "customerCVR")]
    CustomerCvr,
}

impl LookupScope {
    /// GUID-shaped identities are authorization ids, anything else a CVR number.
    pub fn for_identity(identity: &str) -> Self {
        let is_guid = GUID_PATTERN
            .as_ref()
            .map(|re| re.is_match(identity.trim()))
            .unwrap_or(false);
        if is_guid {
            LookupScope::AuthorizationId
        } else {
            LookupScope::CustomerCvr
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LookupScope::AuthorizationId => "authorizationId",
            LookupScope::CustomerCvr => "customerCVR",
        }
    }
}

impl fmt::Display for LookupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LookupScope {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "authorizationId" => Ok(LookupScope::AuthorizationId),
            "customerCVR" => Ok(LookupScope::CustomerCvr),
            other => Err(GatewayError::bad_request(format!(
                "scope must be authorizationId or customerCVR (got '{}')",
                other
            ))),
        }
    }
}

// ============================================================================
// CONSUMPTION QUERY
// ============================================================================

/// A resolved consumption request, ready to be sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionQuery {
    pub identifier: String,
    pub scope: LookupScope,
    pub range: DateRange,
    pub aggregation: Aggregation,
    pub metering_point_ids: Vec<String>,
}

impl ConsumptionQuery {
    /// Cache and coalescing key. Metering point order does not matter.
    pub fn cache_key(&self) -> String {
        let mut ids = self.metering_point_ids.clone();
        ids.sort();
        ids.dedup();
        let from = self.range.from.to_string();
        let to = self.range.to.to_string();
        let parts = [
            self.identifier.as_str(),
            from.as_str(),
            to.as_str(),
            self.aggregation.as_str(),
        ]
        .into_iter()
        .map(str::to_string)
        .chain(ids);
        format!("consumption:{}", crate::digest_key(parts))
    }
}

// ============================================================================
// ACCESS TOKEN
// ============================================================================

/// Short-lived upstream access token.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    /// Expiry in epoch milliseconds.
    pub expires_at_ms: i64,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at_ms: i64) -> Self {
        Self {
            value: SecretString::from(value.into()),
            expires_at_ms,
        }
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining_validity(&self, now_ms: i64) -> Duration {
        let left = self.expires_at_ms.saturating_sub(now_ms);
        Duration::from_millis(left.max(0) as u64)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn query(ids: &[&str]) -> ConsumptionQuery {
        ConsumptionQuery {
            identifier: "12345678".to_string(),
            scope: LookupScope::CustomerCvr,
            range: DateRange {
                from: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            },
            aggregation: Aggregation::Day,
            metering_point_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_scope_for_identity() {
        assert_eq!(
            LookupScope::for_identity("3fa85f64-5717-4562-b3fc-2c963f66afa6"),
            LookupScope::AuthorizationId
        );
        assert_eq!(LookupScope::for_identity("12345678"), LookupScope::CustomerCvr);
        assert_eq!(LookupScope::for_identity("3fa85f64-5717"), LookupScope::CustomerCvr);
    }

    #[test]
    fn test_aggregation_parsing() {
        assert_eq!("hour".parse::<Aggregation>().unwrap(), Aggregation::Hour);
        assert_eq!("Year".parse::<Aggregation>().unwrap(), Aggregation::Year);
        assert!("Quarter".parse::<Aggregation>().is_err());
        assert_eq!(Aggregation::default(), Aggregation::Day);
    }

    #[test]
    fn test_cache_key_ignores_id_order() {
        assert_eq!(query(&["a", "b"]).cache_key(), query(&["b", "a"]).cache_key());
        assert_ne!(query(&["a"]).cache_key(), query(&["a", "b"]).cache_key());
        let mut monthly = query(&["a"]);
        monthly.aggregation = Aggregation::Month;
        assert_ne!(monthly.cache_key(), query(&["a"]).cache_key());
    }

    #[test]
    fn test_access_token_validity() {
        let token = AccessToken::new("secret", 10_000);
        assert_eq!(token.remaining_validity(4_000), Duration::from_secs(6));
        assert_eq!(token.remaining_validity(20_000), Duration::ZERO);
        assert!(!format!("{:?}", token).contains("secret"));
    }
}
