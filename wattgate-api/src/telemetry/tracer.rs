//! Tracing Subscriber Initialization
//!
//! Structured JSON logs filtered through `RUST_LOG` (default `info`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, development)
    pub environment: String,
    /// Emit JSON (true) or human-readable lines (false)
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("WATTGATE_SERVICE_NAME")
                .unwrap_or_else(|_| "wattgate".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: std::env::var("WATTGATE_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            json_logs: std::env::var("WATTGATE_LOG_FORMAT")
                .map(|s| s != "pretty")
                .unwrap_or(true),
        }
    }
}

/// Install the global tracing subscriber. Call once at startup.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init tracing: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        "Tracing initialized"
    );
    Ok(())
}
