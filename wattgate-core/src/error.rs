//! Error types for wattgate operations

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Session authentication errors (401).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No session")]
    MissingSession,

    #[error("Invalid session: {reason}")]
    InvalidSession { reason: String },

    #[error("Session expired")]
    SessionExpired,
}

/// Authorization binding errors (403).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("no authorization linked")]
    NoBinding,

    #[error("customer mismatch")]
    CustomerMismatch,

    #[error("{action} is disabled")]
    ActionDisabled { action: String },
}

/// Shared key-value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Shared store unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Shared store timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Shared store error: {reason}")]
    Backend { reason: String },
}

/// Master error type for all gateway operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Access denied: {0}")]
    Access(#[from] AccessError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Missing parameter: {field}")]
    MissingParameter { field: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Upstream rate limited")]
    UpstreamRateLimited {
        retry_after: Option<String>,
        body: String,
    },

    #[error("Upstream responded with {status}")]
    Upstream { status: u16, body: String },

    #[error("Upstream token error: {reason}")]
    UpstreamToken { reason: String },

    #[error("Unexpected error: {reason}")]
    Unexpected { reason: String },
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingParameter {
            field: field.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::Unexpected {
            reason: reason.into(),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type for shared store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_messages_are_stable() {
        assert_eq!(AccessError::NoBinding.to_string(), "no authorization linked");
        assert_eq!(AccessError::CustomerMismatch.to_string(), "customer mismatch");
    }

    #[test]
    fn test_from_conversions() {
        let err: GatewayError = AuthError::SessionExpired.into();
        assert!(matches!(err, GatewayError::Auth(AuthError::SessionExpired)));
        let err: GatewayError = StoreError::Timeout { timeout_ms: 5 }.into();
        assert!(matches!(err, GatewayError::Store(_)));
    }
}
