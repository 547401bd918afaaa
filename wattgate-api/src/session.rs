//! Session authorization gate.
//!
//! Resolves the caller's signed session cookie to exactly one bound customer
//! identity and rejects any request that names a different customer. The
//! check runs before any upstream work is started.

use axum::http::{header, HeaderMap};
use wattgate_core::{
    AccessError, AuthError, ConfigError, CustomerId, GatewayResult, SharedClock, SigningKey,
};
use wattgate_storage::BindingStore;

/// Verifies sessions and enforces the session → customer binding.
#[derive(Clone)]
pub struct SessionGate {
    /// Absent when the deployment has no usable signing key.
    signing_key: Result<SigningKey, ConfigError>,
    cookie_name: String,
    bindings: BindingStore,
    clock: SharedClock,
}

impl SessionGate {
    pub fn new(
        signing_key: Result<SigningKey, ConfigError>,
        cookie_name: impl Into<String>,
        bindings: BindingStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            signing_key,
            cookie_name: cookie_name.into(),
            bindings,
            clock,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn is_configured(&self) -> bool {
        self.signing_key.is_ok()
    }

    /// Authorize a request and return the customer it may act for.
    ///
    /// `requested_customer` is the identifier the caller put in the request,
    /// if any; it must match the bound customer exactly.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        requested_customer: Option<&str>,
    ) -> GatewayResult<CustomerId> {
        let token = session_cookie(headers, &self.cookie_name).ok_or(AuthError::MissingSession)?;
        let key = self.signing_key.as_ref().map_err(Clone::clone)?;
        let claims = key.verify(&token, self.clock.as_ref())?;

        let customer_id = self
            .bindings
            .customer_for(&claims.session_id)
            .await?
            .ok_or_else(|| {
                tracing::info!(session_id = %claims.session_id, "session has no linked customer");
                AccessError::NoBinding
            })?;

        if let Some(requested) = requested_customer {
            if requested.trim() != customer_id {
                tracing::warn!(
                    session_id = %claims.session_id,
                    "requested customer does not match session binding"
                );
                return Err(AccessError::CustomerMismatch.into());
            }
        }
        Ok(customer_id)
    }
}

/// Value of cookie `name` across all `Cookie` headers.
fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("configured", &self.is_configured())
            .field("cookie_name", &self.cookie_name)
            .field("bindings", &self.bindings)
            .finish()
    }
}
