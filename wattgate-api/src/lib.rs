//! wattgate API - HTTP Gateway Layer
//!
//! Serves the gateway endpoint in front of the third-party energy data
//! provider. Callers authenticate with a signed session cookie and can only
//! reach data bound to their own customer identity; the provider is shielded
//! by caching, request coalescing, retries with backoff and a cross-instance
//! lock around access token refreshes.

pub mod config;
pub mod error;
pub mod gateway;
pub mod resilience;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod token;
pub mod upstream_http;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use gateway::{ConsumptionParams, Gateway, GatewaySettings};
pub use resilience::{RequestCoalescer, RetryExecutor, RetryPolicy};
pub use routes::{create_router, serve};
pub use session::SessionGate;
pub use state::AppState;
pub use token::{TokenManager, TokenSettings};
pub use upstream_http::HttpUpstream;
