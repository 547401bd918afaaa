//! HTTP Routes Module
//!
//! - The gateway endpoint at /api/gateway
//! - Health check endpoints at /health/*
//! - Prometheus metrics at /metrics
//! - CORS support for browser-based clients

pub mod gateway;
pub mod health;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::config::GatewayConfig;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

/// Create the complete router.
///
/// Layers, outermost first: CORS, panic catching (answers 500 with a generic
/// body), observability.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    Router::new()
        .merge(gateway::create_router())
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(from_fn(observability_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
}

/// Serve `router` on `listener` until `shutdown` resolves, then stop accepting
/// connections and let in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> ApiResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
    tracing::info!("server drained, exiting");
    Ok(())
}

fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    use axum::response::IntoResponse;
    tracing::error!("request handler panicked");
    ApiError::internal_error("Internal server error").into_response()
}

/// Build the CORS layer from the gateway configuration.
///
/// In development mode (empty origins), allows all origins.
/// Otherwise only the configured origins, optionally with credentials so the
/// session cookie is sent.
fn build_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::RETRY_AFTER, HeaderName::from_static("x-request-id")])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any).allow_headers(Any).expose_headers(Any)
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS: allowing configured origins");
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        if config.cors_allow_credentials {
            cors.allow_origin(origins).allow_credentials(true)
        } else {
            cors.allow_origin(origins)
        }
    }
}
