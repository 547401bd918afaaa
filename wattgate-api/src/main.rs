//! wattgate Server Entry Point
//!
//! Loads configuration, connects the shared store and starts the Axum HTTP
//! server.

use std::net::SocketAddr;
use std::sync::Arc;

use wattgate_api::telemetry::{init_tracing, TelemetryConfig};
use wattgate_api::{create_router, serve, ApiError, ApiResult, AppState, GatewayConfig, HttpUpstream};
use wattgate_core::GatewayError;
use wattgate_storage::{InMemoryStore, RedisStore, SharedStore};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let config = GatewayConfig::from_env();
    config
        .validate_for_production()
        .map_err(|e| ApiError::from(GatewayError::from(e)))?;
    tracing::info!(config = ?config, "configuration loaded");

    let store: Arc<dyn SharedStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .map_err(|e| ApiError::from(GatewayError::from(e)))?,
        ),
        None => {
            tracing::warn!("no shared store configured, using process-local store");
            Arc::new(InMemoryStore::new())
        }
    };

    let upstream = HttpUpstream::new(&config.upstream_base_url, config.upstream_timeout)
        .map_err(|e| ApiError::from(GatewayError::from(e)))?;

    let addr = resolve_bind_addr(&config)?;
    let app = create_router(AppState::new(config, Arc::new(upstream), store));

    tracing::info!(%addr, "Starting wattgate server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    serve(listener, app, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received, draining connections"),
        Err(e) => {
            // Without a signal handler the server runs until killed.
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

fn resolve_bind_addr(config: &GatewayConfig) -> ApiResult<SocketAddr> {
    let addr = format!("{}:{}", config.bind_addr, config.port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
