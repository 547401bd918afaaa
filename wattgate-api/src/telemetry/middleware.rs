//! Axum Middleware for HTTP Request Tracing and Metrics
//!
//! Every request gets a tracing span, a request id and a Prometheus sample.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info_span, Instrument};

use super::metrics::metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Observability middleware for Axum.
///
/// The path label is the route path only; the gateway keeps its variability
/// in the query string and body, so cardinality stays bounded.
pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!(
        "http_request",
        http.method = %method,
        http.target = %path,
        request_id = %request_id,
    );

    let mut response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    let status = response.status();
    if let Some(m) = metrics() {
        m.record_http_request(method.as_str(), &path, status.as_u16(), duration.as_secs_f64());
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        request_id = %request_id,
        "Request completed"
    );

    response
}
