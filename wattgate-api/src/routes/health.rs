//! Liveness and readiness probes.
//!
//! `/health/ping` only proves the process answers. `/health/ready` also pings
//! the shared store, since locks and session bindings live there. Neither
//! probe needs a session.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub store: ComponentHealth,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/ready - Readiness check (shared store connectivity)
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let store = match state.store.ping().await {
        Ok(()) => ComponentHealth {
            status: HealthStatus::Healthy,
            backend: state.store.backend_name().to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            ComponentHealth {
                status: HealthStatus::Unhealthy,
                backend: state.store.backend_name().to_string(),
                latency_ms: None,
                error: Some(e.to_string()),
            }
        }
    };

    let overall = store.status;
    let response = HealthResponse {
        status: overall,
        message: (overall == HealthStatus::Unhealthy)
            .then(|| "shared store unreachable".to_string()),
        details: Some(HealthDetails {
            store,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.uptime().as_secs(),
        }),
    };
    let status_code = match overall {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router (no session required)
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/ready", get(readiness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_store_serialization() {
        let response = HealthResponse {
            status: HealthStatus::Unhealthy,
            message: Some("shared store unreachable".to_string()),
            details: Some(HealthDetails {
                store: ComponentHealth {
                    status: HealthStatus::Unhealthy,
                    backend: "redis".to_string(),
                    latency_ms: None,
                    error: Some("connection refused".to_string()),
                },
                version: "0.1.0".to_string(),
                uptime_seconds: 3,
            }),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["details"]["store"]["backend"], "redis");
        assert!(json["details"]["store"].get("latency_ms").is_none());
    }
}
