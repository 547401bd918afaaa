//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Duration;

use wattgate_core::{SharedClock, SystemClock, UpstreamApi};
use wattgate_storage::{BindingStore, DistributedLock, SharedStore};

use crate::config::GatewayConfig;
use crate::gateway::{Gateway, GatewaySettings};
use crate::resilience::RetryExecutor;
use crate::session::SessionGate;
use crate::token::{TokenManager, TokenSettings};

/// Application-wide state shared across all routes.
///
/// Every per-process structure (caches, coalescers, token cache) hangs off
/// this value, so tests get fresh instances by building a new state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub sessions: SessionGate,
    /// Shared store backing locks and session bindings.
    pub store: Arc<dyn SharedStore>,
    pub config: Arc<GatewayConfig>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire the gateway together using the system clock.
    pub fn new(
        config: GatewayConfig,
        upstream: Arc<dyn UpstreamApi>,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        Self::with_clock(config, upstream, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GatewayConfig,
        upstream: Arc<dyn UpstreamApi>,
        store: Arc<dyn SharedStore>,
        clock: SharedClock,
    ) -> Self {
        let retry = RetryExecutor::new(config.retry_policy());
        let lock = DistributedLock::new(Arc::clone(&store), config.lock_timeout)
            .with_clock(clock.clone());

        let tokens = TokenManager::new(
            Arc::clone(&upstream),
            config.refresh_token.clone(),
            lock,
            retry,
            TokenSettings {
                lifetime: config.token_lifetime,
                min_validity: config.token_min_validity,
                lock_ttl: config.lock_ttl,
            },
            config.coalesce_grace,
            clock.clone(),
        );

        let gateway = Gateway::new(
            upstream,
            tokens,
            retry,
            GatewaySettings {
                consumption_cache_ttl: config.consumption_cache_ttl,
                consumption_cache_max: config.consumption_cache_max,
                metering_cache_ttl: config.metering_cache_ttl,
                metering_cache_max: config.metering_cache_max,
                authorizations_cache_ttl: config.authorizations_cache_ttl,
                coalesce_grace: config.coalesce_grace,
                utc_offset: config.utc_offset,
            },
            clock.clone(),
        );

        let sessions = SessionGate::new(
            config.signing_key(),
            config.session_cookie.clone(),
            BindingStore::new(Arc::clone(&store)),
            clock,
        );

        Self {
            gateway,
            sessions,
            store,
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
