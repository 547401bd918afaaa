//! Consumption aggregation over time-series payloads.
//!
//! The provider answers with
//! `result[*].MyEnergyData_MarketDocument.TimeSeries[*].Period[*].Point[*]`,
//! each point carrying its quantity under `out_Quantity.quantity` as either a
//! string or a number.

use serde_json::Value;

const QUANTITY_FIELD: &str = "out_Quantity.quantity";

/// Sum every point quantity across all metering points, series and periods.
/// Quantities that do not parse count as zero.
pub fn total_consumption(payload: &Value) -> f64 {
    items(payload.get("result"))
        .filter_map(|entry| entry.get("MyEnergyData_MarketDocument"))
        .flat_map(|doc| items(doc.get("TimeSeries")))
        .flat_map(|series| items(series.get("Period")))
        .flat_map(|period| items(period.get("Point")))
        .map(|point| quantity(point.get(QUANTITY_FIELD)))
        .sum()
}

fn items(value: Option<&Value>) -> impl Iterator<Item = &Value> {
    value
        .and_then(Value::as_array)
        .map(|arr| arr.iter())
        .into_iter()
        .flatten()
}

fn quantity(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}
