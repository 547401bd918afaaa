//! Signed session tokens.
//!
//! A session token is an HS256 JWT carrying `sessionId` and an optional
//! `expiresAt` in epoch milliseconds. The signing key is loaded once at
//! startup. Signature validation is delegated to `jsonwebtoken`; expiry is
//! checked here against an injected [`Clock`] so tests never depend on the
//! system time.

use crate::clock::Clock;
use crate::error::{AuthError, ConfigError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Minimum signing key length after decoding.
pub const MIN_SIGNING_KEY_BYTES: usize = 32;

static BASE64_SHAPE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").ok());

// ============================================================================
// CLAIMS
// ============================================================================

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(rename = "sessionId")]
    pub session_id: String,

    /// Expiry in epoch milliseconds. Absent means the session does not expire
    /// on its own.
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl SessionClaims {
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= clock.now_millis())
    }
}

// ============================================================================
// SIGNING KEY
// ============================================================================

/// Process-wide session signing key.
///
/// Debug output never shows the key material.
#[derive(Clone)]
pub struct SigningKey(Arc<SecretSlice<u8>>);

impl SigningKey {
    /// Build the key from its configured textual form.
    ///
    /// The value is trimmed. If it looks like base64 and decodes to at least
    /// [`MIN_SIGNING_KEY_BYTES`] bytes, the decoded bytes are used; otherwise
    /// the raw UTF-8 bytes are. Either way the result must be at least
    /// [`MIN_SIGNING_KEY_BYTES`] long.
    pub fn from_config(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "session_secret".to_string(),
            });
        }

        let bytes = decode_if_base64(trimmed).unwrap_or_else(|| trimmed.as_bytes().to_vec());
        if bytes.len() < MIN_SIGNING_KEY_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "session_secret".to_string(),
                reason: format!(
                    "must be at least {} bytes, got {}",
                    MIN_SIGNING_KEY_BYTES,
                    bytes.len()
                ),
            });
        }
        Ok(Self(Arc::new(SecretSlice::from(bytes))))
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify a session token and return its claims.
    pub fn verify(&self, token: &str, clock: &dyn Clock) -> Result<SessionClaims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingSession);
        }

        let decoding_key = DecodingKey::from_secret(self.0.expose_secret());
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry lives in `expiresAt` (milliseconds), not the registered `exp`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<SessionClaims>(token, &decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSession {
                    reason: "signature is invalid".to_string(),
                },
                _ => AuthError::InvalidSession {
                    reason: format!("token validation failed: {}", e),
                },
            })?
            .claims;

        if claims.session_id.trim().is_empty() {
            return Err(AuthError::InvalidSession {
                reason: "sessionId is empty".to_string(),
            });
        }
        if claims.is_expired(clock) {
            return Err(AuthError::SessionExpired);
        }
        Ok(claims)
    }

    /// Sign a session token. Used by the external login flow and by tests.
    pub fn issue_session(
        &self,
        session_id: impl Into<String>,
        expires_at: Option<i64>,
    ) -> Result<String, ConfigError> {
        let claims = SessionClaims {
            session_id: session_id.into(),
            expires_at,
        };
        let encoding_key = EncodingKey::from_secret(self.0.expose_secret());
        encode(&Header::new(Algorithm::HS256), &claims, &encoding_key).map_err(|e| {
            ConfigError::InvalidValue {
                field: "session_secret".to_string(),
                reason: format!("failed to sign session: {}", e),
            }
        })
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey([REDACTED, {} bytes])", self.len())
    }
}

fn decode_if_base64(value: &str) -> Option<Vec<u8>> {
    let shape = BASE64_SHAPE.as_ref()?;
    if value.len() % 4 != 0 || !shape.is_match(value) {
        return None;
    }
    STANDARD
        .decode(value)
        .ok()
        .filter(|bytes| bytes.len() >= MIN_SIGNING_KEY_BYTES)
}
