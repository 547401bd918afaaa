//! Prometheus Metrics Definitions
//!
//! Defines all wattgate metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Upstream call latency buckets (seconds). The provider is slow.
const UPSTREAM_LATENCY_BUCKETS: &[f64] = &[0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<GatewayMetrics>> = Lazy::new(GatewayMetrics::new);

/// Registered metrics, or `None` if registration failed.
pub fn metrics() -> Option<&'static GatewayMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all wattgate metrics.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Gateway actions - labels: action, status
    pub gateway_actions_total: CounterVec,

    /// Upstream calls - labels: endpoint, status
    pub upstream_requests_total: CounterVec,

    /// Upstream call duration - labels: endpoint
    pub upstream_request_duration_seconds: HistogramVec,

    /// Retries after a transient upstream failure - labels: endpoint, status
    pub upstream_retries_total: CounterVec,

    /// Cache lookups - labels: cache, result (hit/miss)
    pub cache_lookups_total: CounterVec,

    /// Callers that joined an in-flight operation - labels: operation
    pub coalesced_requests_total: CounterVec,

    /// Lock acquisition outcomes - labels: lock, outcome
    pub lock_acquisitions_total: CounterVec,

    /// Access token refreshes - labels: status
    pub token_refreshes_total: CounterVec,
}

fn registration_error(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

impl GatewayMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "wattgate_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "wattgate_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            gateway_actions_total: register_counter_vec!(
                "wattgate_gateway_actions_total",
                "Gateway actions by outcome",
                &["action", "status"]
            )
            .map_err(|e| registration_error("gateway_actions_total", e))?,

            upstream_requests_total: register_counter_vec!(
                "wattgate_upstream_requests_total",
                "Calls made to the upstream provider",
                &["endpoint", "status"]
            )
            .map_err(|e| registration_error("upstream_requests_total", e))?,

            upstream_request_duration_seconds: register_histogram_vec!(
                "wattgate_upstream_request_duration_seconds",
                "Upstream provider call duration in seconds",
                &["endpoint"],
                UPSTREAM_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("upstream_request_duration_seconds", e))?,

            upstream_retries_total: register_counter_vec!(
                "wattgate_upstream_retries_total",
                "Upstream calls retried after a transient failure",
                &["endpoint", "status"]
            )
            .map_err(|e| registration_error("upstream_retries_total", e))?,

            cache_lookups_total: register_counter_vec!(
                "wattgate_cache_lookups_total",
                "In-process cache lookups",
                &["cache", "result"]
            )
            .map_err(|e| registration_error("cache_lookups_total", e))?,

            coalesced_requests_total: register_counter_vec!(
                "wattgate_coalesced_requests_total",
                "Callers that joined an in-flight identical operation",
                &["operation"]
            )
            .map_err(|e| registration_error("coalesced_requests_total", e))?,

            lock_acquisitions_total: register_counter_vec!(
                "wattgate_lock_acquisitions_total",
                "Distributed lock acquisition outcomes",
                &["lock", "outcome"]
            )
            .map_err(|e| registration_error("lock_acquisitions_total", e))?,

            token_refreshes_total: register_counter_vec!(
                "wattgate_token_refreshes_total",
                "Upstream access token refreshes",
                &["status"]
            )
            .map_err(|e| registration_error("token_refreshes_total", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status_str.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_action(&self, action: &str, status: u16) {
        let status_str = status.to_string();
        self.gateway_actions_total
            .with_label_values(&[action, status_str.as_str()])
            .inc();
    }

    /// Record a single upstream call.
    pub fn record_upstream_call(&self, endpoint: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.upstream_requests_total
            .with_label_values(&[endpoint, status_str.as_str()])
            .inc();
        self.upstream_request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(duration_secs);
    }

    pub fn record_retry(&self, endpoint: &str, status: u16) {
        let status_str = status.to_string();
        self.upstream_retries_total
            .with_label_values(&[endpoint, status_str.as_str()])
            .inc();
    }

    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[cache, result])
            .inc();
    }

    pub fn record_coalesced(&self, operation: &str) {
        self.coalesced_requests_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn record_lock(&self, lock: &str, outcome: &str) {
        self.lock_acquisitions_total
            .with_label_values(&[lock, outcome])
            .inc();
    }

    pub fn record_token_refresh(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.token_refreshes_total
            .with_label_values(&[status])
            .inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    // Make sure the gateway metrics are registered before the first scrape.
    let _ = metrics();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_record_gateway_events() -> Result<(), String> {
        let metrics = metrics().ok_or("Metrics init failed")?;
        metrics.record_http_request("POST", "/api/gateway", 200, 0.015);
        metrics.record_action("thirdparty-consumption", 200);
        metrics.record_upstream_call("time_series", 429, 0.2);
        metrics.record_retry("time_series", 429);
        metrics.record_cache_lookup("consumption", true);
        metrics.record_coalesced("consumption");
        metrics.record_lock("token_refresh", "unavailable");
        metrics.record_token_refresh(true);

        let before = metrics
            .cache_lookups_total
            .with_label_values(&["metering_points", "miss"])
            .get();
        metrics.record_cache_lookup("metering_points", false);
        let after = metrics
            .cache_lookups_total
            .with_label_values(&["metering_points", "miss"])
            .get();
        assert!(after > before);
        Ok(())
    }
}
