//! Date range clamping for consumption queries.
//!
//! The provider publishes meter data with a one to two day delay, so the
//! latest date that can be requested is yesterday (at noon local time).

use crate::error::GatewayError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Days subtracted from the clamped `to` when `from` ends up after it.
pub const FALLBACK_WINDOW_DAYS: i64 = 30;

/// Inclusive date range sent to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Yesterday at 12:00 relative to `now` (local time).
pub fn latest_available_date(now: NaiveDateTime) -> NaiveDateTime {
    let yesterday = now.date() - Duration::days(1);
    yesterday.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN))
}

/// Clamp a requested range into the window the provider has data for.
pub fn clamp_date_range(from: NaiveDate, to: NaiveDate, now: NaiveDateTime) -> DateRange {
    let latest = latest_available_date(now).date();
    let to = if to > latest { latest } else { to };
    let from = if from > to {
        to - Duration::days(FALLBACK_WINDOW_DAYS)
    } else {
        from
    };
    DateRange { from, to }
}

/// Parse `YYYY-MM-DD`, also accepting a full RFC 3339 or naive ISO 8601
/// timestamp by its date part. Anything left over is rejected.
pub fn parse_query_date(field: &str, value: &str) -> Result<NaiveDate, GatewayError> {
    let trimmed = value.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed).map(|dt| dt.date_naive()))
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date()))
        .map_err(|_| GatewayError::bad_request(format!("{} must be a YYYY-MM-DD date", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
    }

    #[test]
    fn test_clamps_future_range() {
        let now = at("2025-06-15T10:00");
        let range = clamp_date_range(date("2025-06-18"), date("2025-06-20"), now);
        assert_eq!(range.to, date("2025-06-14"));
        assert_eq!(range.from, date("2025-05-15"));
    }

    #[test]
    fn test_keeps_valid_range() {
        let now = at("2025-06-15T10:00");
        let range = clamp_date_range(date("2025-05-01"), date("2025-06-01"), now);
        assert_eq!(range.from, date("2025-05-01"));
        assert_eq!(range.to, date("2025-06-01"));
    }

    #[test]
    fn test_from_equal_to_clamped_to_is_kept() {
        let now = at("2025-06-15T23:59");
        let range = clamp_date_range(date("2025-06-14"), date("2025-07-01"), now);
        assert_eq!(range.from, date("2025-06-14"));
        assert_eq!(range.to, date("2025-06-14"));
    }

    #[test]
    fn test_latest_available_is_yesterday_noon() {
        let latest = latest_available_date(at("2025-03-01T00:30"));
        assert_eq!(latest, at("2025-02-28T12:00"));
    }

    #[test]
    fn test_parse_query_date() {
        assert_eq!(parse_query_date("dateFrom", "2025-01-02").unwrap(), date("2025-01-02"));
        assert_eq!(
            parse_query_date("dateFrom", "2025-01-02T00:00:00Z").unwrap(),
            date("2025-01-02")
        );
        assert!(matches!(
            parse_query_date("dateTo", "02/01/2025"),
            Err(GatewayError::BadRequest { .. })
        ));
        assert!(parse_query_date("dateTo", "").is_err());
    }

    #[test]
    fn test_parse_query_date_rejects_trailing_text() {
        for value in ["2025-01-01garbage", "2025-01-01 junk", "2025-01-01T", "2025-01-01Z"] {
            assert!(
                matches!(parse_query_date("dateFrom", value), Err(GatewayError::BadRequest { .. })),
                "{} should be rejected",
                value
            );
        }
        assert_eq!(
            parse_query_date("dateFrom", " 2025-01-02T08:30:00 ").unwrap(),
            date("2025-01-02")
        );
        assert_eq!(
            parse_query_date("dateFrom", "2025-01-02T23:30:00+02:00").unwrap(),
            date("2025-01-02")
        );
    }

    fn arb_day() -> impl Strategy<Value = NaiveDate> {
        (0i64..40_000).prop_map(|offset| date("1990-01-01") + Duration::days(offset))
    }

    proptest! {
        #[test]
        fn prop_clamped_range_is_ordered_and_available(
            from in arb_day(),
            to in arb_day(),
            today in arb_day(),
            minutes in 0u32..1440,
        ) {
            let now = today.and_time(
                NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0).unwrap(),
            );
            let range = clamp_date_range(from, to, now);
            let latest = latest_available_date(now).date();

            prop_assert!(range.from <= range.to);
            prop_assert!(range.to <= latest);
            prop_assert!(range.to <= to);
            if from <= range.to {
                prop_assert_eq!(range.from, from);
            } else {
                prop_assert_eq!(range.from, range.to - Duration::days(FALLBACK_WINDOW_DAYS));
            }
        }
    }
}
