//! Error Types for the wattgate HTTP surface
//!
//! This module is the single place where gateway error kinds become HTTP
//! status codes:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! Error bodies are JSON of the form `{"error": CODE, "message": ..., "details": ...}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use wattgate_core::{AccessError, AuthError, GatewayError};

/// Retry hint sent with 429 responses when the provider gave none.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication Errors (401, 403)
    // ========================================================================
    /// No session was presented
    Unauthorized,

    /// Session token failed verification
    InvalidSession,

    /// Session token has expired
    SessionExpired,

    /// Session has no linked customer
    NoAuthorizationLinked,

    /// Requested customer differs from the session's customer
    CustomerMismatch,

    /// Action is switched off on this deployment
    ActionDisabled,

    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Required parameter is missing
    MissingParameter,

    /// Request contains invalid input data
    InvalidInput,

    /// The `action` parameter is absent or unknown
    UnknownAction,

    // ========================================================================
    // Not Found (404)
    // ========================================================================
    NotFound,

    // ========================================================================
    // Upstream (429, 5xx)
    // ========================================================================
    /// Provider rate limit persisted through all retries
    RateLimited,

    /// Provider answered with a non-success status
    UpstreamError,

    /// Provider token endpoint failed or returned no token
    UpstreamTokenError,

    // ========================================================================
    // Server Errors (500)
    // ========================================================================
    ConfigurationError,

    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized | ErrorCode::InvalidSession | ErrorCode::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::NoAuthorizationLinked
            | ErrorCode::CustomerMismatch
            | ErrorCode::ActionDisabled => StatusCode::FORBIDDEN,
            ErrorCode::MissingParameter | ErrorCode::InvalidInput | ErrorCode::UnknownAction => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamError | ErrorCode::UpstreamTokenError => StatusCode::BAD_GATEWAY,
            ErrorCode::ConfigurationError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "No session",
            ErrorCode::InvalidSession => "Invalid session",
            ErrorCode::SessionExpired => "Session expired",
            ErrorCode::NoAuthorizationLinked => "no authorization linked",
            ErrorCode::CustomerMismatch => "customer mismatch",
            ErrorCode::ActionDisabled => "Action is disabled",
            ErrorCode::MissingParameter => "Required parameter is missing",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::UnknownAction => "Unknown action",
            ErrorCode::NotFound => "Not found",
            ErrorCode::RateLimited => "Upstream rate limit exceeded",
            ErrorCode::UpstreamError => "Upstream request failed",
            ErrorCode::UpstreamTokenError => "Could not obtain upstream access token",
            ErrorCode::ConfigurationError => "Gateway is not configured",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    #[serde(rename = "error")]
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (upstream body, offending field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Status to send instead of the code's default (upstream passthrough).
    #[serde(skip)]
    pub status_override: Option<StatusCode>,

    /// `Retry-After` header value for 429 responses.
    #[serde(skip)]
    pub retry_after: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            status_override: None,
            retry_after: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status_override = Some(status);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_override
            .unwrap_or_else(|| self.code.status_code())
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn missing_parameter(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingParameter,
            format!("Missing required parameter: {}", field),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn unknown_action(action: Option<&str>) -> Self {
        match action {
            Some(action) => Self::new(ErrorCode::UnknownAction, format!("Unknown action: {}", action)),
            None => Self::new(ErrorCode::UnknownAction, "Missing action parameter"),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn rate_limited(retry_after: Option<String>) -> Self {
        let mut err = Self::from_code(ErrorCode::RateLimited);
        err.retry_after =
            Some(retry_after.unwrap_or_else(|| DEFAULT_RETRY_AFTER_SECS.to_string()));
        err
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after.clone();
        let mut response = (status, Json(self)).into_response();
        if let Some(value) = retry_after.and_then(|v| HeaderValue::from_str(&v).ok()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

// ============================================================================
// CONVERSIONS FROM GATEWAY ERRORS
// ============================================================================

/// Parse an upstream body as JSON when possible so clients get structure back.
fn upstream_details(body: String) -> serde_json::Value {
    serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Config(e) => {
                tracing::error!(error = %e, "gateway configuration error");
                ApiError::new(ErrorCode::ConfigurationError, e.to_string())
            }
            GatewayError::Auth(AuthError::MissingSession) => {
                ApiError::from_code(ErrorCode::Unauthorized)
            }
            GatewayError::Auth(AuthError::SessionExpired) => {
                ApiError::from_code(ErrorCode::SessionExpired)
            }
            GatewayError::Auth(AuthError::InvalidSession { reason }) => {
                tracing::debug!(reason = %reason, "session rejected");
                ApiError::from_code(ErrorCode::InvalidSession)
            }
            GatewayError::Access(AccessError::NoBinding) => {
                ApiError::from_code(ErrorCode::NoAuthorizationLinked)
            }
            GatewayError::Access(AccessError::CustomerMismatch) => {
                ApiError::from_code(ErrorCode::CustomerMismatch)
            }
            GatewayError::Access(e @ AccessError::ActionDisabled { .. }) => {
                ApiError::new(ErrorCode::ActionDisabled, e.to_string())
            }
            GatewayError::BadRequest { message } => ApiError::invalid_input(message),
            GatewayError::MissingParameter { field } => ApiError::missing_parameter(&field),
            GatewayError::NotFound { message } => ApiError::not_found(message),
            GatewayError::UpstreamRateLimited { retry_after, body } => {
                ApiError::rate_limited(retry_after).with_details(upstream_details(body))
            }
            GatewayError::Upstream { status, body } => {
                let status = StatusCode::from_u16(status)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                ApiError::new(
                    ErrorCode::UpstreamError,
                    format!("Upstream responded with {}", status.as_u16()),
                )
                .with_status(status)
                .with_details(upstream_details(body))
            }
            GatewayError::UpstreamToken { reason } => {
                tracing::error!(reason = %reason, "upstream token error");
                ApiError::from_code(ErrorCode::UpstreamTokenError)
            }
            GatewayError::Store(e) => {
                tracing::error!(error = %e, "shared store failure");
                ApiError::from_code(ErrorCode::InternalError)
            }
            GatewayError::Unexpected { reason } => {
                tracing::error!(reason = %reason, "unexpected gateway failure");
                ApiError::from_code(ErrorCode::InternalError)
            }
        }
    }
}

/// Convert from serde_json::Error to ApiError.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use wattgate_core::{ConfigError, StoreError};

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::CustomerMismatch.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::MissingParameter.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ErrorCode::ConfigurationError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_gateway_error_mapping() {
        let cases: Vec<(GatewayError, StatusCode)> = vec![
            (AuthError::MissingSession.into(), StatusCode::UNAUTHORIZED),
            (AuthError::SessionExpired.into(), StatusCode::UNAUTHORIZED),
            (AccessError::NoBinding.into(), StatusCode::FORBIDDEN),
            (AccessError::CustomerMismatch.into(), StatusCode::FORBIDDEN),
            (GatewayError::missing("dateFrom"), StatusCode::BAD_REQUEST),
            (GatewayError::not_found("no metering points"), StatusCode::NOT_FOUND),
            (
                ConfigError::MissingRequired { field: "x".into() }.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StoreError::Timeout { timeout_ms: 5 }.into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (GatewayError::unexpected("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err.clone()).status_code(), status, "{:?}", err);
        }
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let err = ApiError::from(GatewayError::Upstream {
            status: 500,
            body: r#"{"error":"boom"}"#.to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, ErrorCode::UpstreamError);
        assert_eq!(err.details, Some(serde_json::json!({ "error": "boom" })));

        let weird = ApiError::from(GatewayError::Upstream {
            status: 200,
            body: "not json".to_string(),
        });
        assert_eq!(weird.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(weird.details, Some(serde_json::json!("not json")));
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(GatewayError::UpstreamRateLimited {
            retry_after: Some("17".to_string()),
            body: String::new(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "17");

        let response = ApiError::rate_limited(None).into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
    }

    #[test]
    fn test_unexpected_errors_do_not_leak() {
        let err = ApiError::from(GatewayError::unexpected("panicked at src/secret.rs:42"));
        assert_eq!(err.message, "Internal server error");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::from_code(ErrorCode::NoAuthorizationLinked);
        let json = serde_json::to_value(&err)?;
        assert_eq!(json["error"], "NO_AUTHORIZATION_LINKED");
        assert_eq!(json["message"], "no authorization linked");
        assert!(json.get("details").is_none());
        Ok(())
    }
}
