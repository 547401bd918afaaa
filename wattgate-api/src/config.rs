//! Gateway Configuration Module
//!
//! Configuration is loaded from `WATTGATE_*` environment variables with
//! defaults suitable for local development. Secrets are held as
//! [`SecretString`] and never appear in `Debug` output.

use crate::resilience::RetryPolicy;
use chrono::FixedOffset;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use wattgate_core::{ConfigError, SigningKey};

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.eloverblik.dk/thirdpartyapi";
pub const DEFAULT_SESSION_COOKIE: &str = "wattgate_session";

// ============================================================================
// GATEWAY CONFIGURATION
// ============================================================================

#[derive(Clone)]
pub struct GatewayConfig {
    /// Deployment environment ("development" or "production").
    pub environment: String,

    // ========================================================================
    // Server
    // ========================================================================
    pub bind_addr: String,
    pub port: u16,

    // ========================================================================
    // Upstream provider
    // ========================================================================
    pub upstream_base_url: String,
    pub upstream_timeout: Duration,
    /// Long-lived refresh credential exchanged for access tokens.
    pub refresh_token: Option<SecretString>,
    /// Validity assigned to freshly issued access tokens.
    pub token_lifetime: Duration,
    /// Cached tokens with less validity left than this are refreshed.
    pub token_min_validity: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,

    // ========================================================================
    // Sessions
    // ========================================================================
    pub session_secret: Option<SecretString>,
    pub session_cookie: String,

    // ========================================================================
    // Shared store and locking
    // ========================================================================
    /// Redis URL. Unset means a process-local store (single instance only).
    pub redis_url: Option<String>,
    pub lock_ttl: Duration,
    /// Upper bound on a single lock round trip before degrading.
    pub lock_timeout: Duration,

    // ========================================================================
    // Caching and coalescing
    // ========================================================================
    pub coalesce_grace: Duration,
    pub consumption_cache_ttl: Duration,
    pub consumption_cache_max: usize,
    pub metering_cache_ttl: Duration,
    pub metering_cache_max: usize,
    pub authorizations_cache_ttl: Duration,
    /// Zone for "yesterday" when clamping dates. Unset uses the host zone.
    pub utc_offset: Option<FixedOffset>,

    // ========================================================================
    // Surface
    // ========================================================================
    /// Serve the unauthenticated pass-through actions.
    pub direct_actions_enabled: bool,
    /// Allowed CORS origins. Empty means allow all (development).
    pub cors_origins: Vec<String>,
    pub cors_allow_credentials: bool,
    pub cors_max_age_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            upstream_timeout: Duration::from_secs(30),
            refresh_token: None,
            token_lifetime: Duration::from_secs(20 * 60),
            token_min_validity: Duration::from_secs(15),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            session_secret: None,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            redis_url: None,
            lock_ttl: Duration::from_secs(30),
            lock_timeout: Duration::from_millis(500),
            coalesce_grace: Duration::from_millis(100),
            consumption_cache_ttl: Duration::from_secs(300),
            consumption_cache_max: 500,
            metering_cache_ttl: Duration::from_secs(3600),
            metering_cache_max: 1000,
            authorizations_cache_ttl: Duration::from_secs(60),
            utc_offset: None,
            direct_actions_enabled: false,
            cors_origins: Vec::new(),
            cors_allow_credentials: false,
            cors_max_age_secs: 86400,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl GatewayConfig {
    /// Create GatewayConfig from environment variables.
    ///
    /// Environment variables:
    /// - `WATTGATE_UPSTREAM_BASE_URL`: Provider API root
    /// - `WATTGATE_REFRESH_TOKEN`: Provider refresh credential
    /// - `WATTGATE_SESSION_SECRET`: Session signing key (>= 32 bytes)
    /// - `WATTGATE_SESSION_COOKIE`: Session cookie name (default: wattgate_session)
    /// - `WATTGATE_REDIS_URL`: Shared store; unset = in-memory
    /// - `WATTGATE_DIRECT_ACTIONS`: Enable unauthenticated actions (default: false)
    /// - `WATTGATE_ENVIRONMENT`: "production" enables strict validation
    /// - `WATTGATE_API_BIND`, `PORT` / `WATTGATE_API_PORT`: Listen address
    ///
    /// Timing, retry and cache knobs follow the same `WATTGATE_` prefix.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_origins = env_string("WATTGATE_CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let port = env_string("PORT")
            .or_else(|| env_string("WATTGATE_API_PORT"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        Self {
            environment: env_string("WATTGATE_ENVIRONMENT")
                .map(|s| s.to_lowercase())
                .unwrap_or(defaults.environment),
            bind_addr: env_string("WATTGATE_API_BIND").unwrap_or(defaults.bind_addr),
            port,
            upstream_base_url: env_string("WATTGATE_UPSTREAM_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.upstream_base_url),
            upstream_timeout: Duration::from_secs(env_parse(
                "WATTGATE_UPSTREAM_TIMEOUT_SECS",
                defaults.upstream_timeout.as_secs(),
            )),
            refresh_token: env_string("WATTGATE_REFRESH_TOKEN").map(SecretString::from),
            token_lifetime: Duration::from_secs(env_parse(
                "WATTGATE_TOKEN_LIFETIME_SECS",
                defaults.token_lifetime.as_secs(),
            )),
            token_min_validity: Duration::from_secs(env_parse(
                "WATTGATE_TOKEN_MIN_VALIDITY_SECS",
                defaults.token_min_validity.as_secs(),
            )),
            retry_max_attempts: env_parse(
                "WATTGATE_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            )
            .max(1),
            retry_base_delay: Duration::from_millis(env_parse(
                "WATTGATE_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )),
            session_secret: env_string("WATTGATE_SESSION_SECRET").map(SecretString::from),
            session_cookie: env_string("WATTGATE_SESSION_COOKIE")
                .unwrap_or(defaults.session_cookie),
            redis_url: env_string("WATTGATE_REDIS_URL"),
            lock_ttl: Duration::from_secs(env_parse(
                "WATTGATE_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )),
            lock_timeout: Duration::from_millis(env_parse(
                "WATTGATE_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            )),
            coalesce_grace: Duration::from_millis(env_parse(
                "WATTGATE_COALESCE_GRACE_MS",
                defaults.coalesce_grace.as_millis() as u64,
            )),
            consumption_cache_ttl: Duration::from_secs(env_parse(
                "WATTGATE_CONSUMPTION_CACHE_TTL_SECS",
                defaults.consumption_cache_ttl.as_secs(),
            )),
            consumption_cache_max: env_parse(
                "WATTGATE_CONSUMPTION_CACHE_MAX",
                defaults.consumption_cache_max,
            ),
            metering_cache_ttl: Duration::from_secs(env_parse(
                "WATTGATE_METERING_CACHE_TTL_SECS",
                defaults.metering_cache_ttl.as_secs(),
            )),
            metering_cache_max: env_parse(
                "WATTGATE_METERING_CACHE_MAX",
                defaults.metering_cache_max,
            ),
            authorizations_cache_ttl: Duration::from_secs(env_parse(
                "WATTGATE_AUTHORIZATIONS_CACHE_TTL_SECS",
                defaults.authorizations_cache_ttl.as_secs(),
            )),
            utc_offset: env_string("WATTGATE_UTC_OFFSET_MINUTES")
                .and_then(|raw| raw.trim().parse::<i32>().ok())
                .and_then(|minutes| minutes.checked_mul(60))
                .and_then(FixedOffset::east_opt),
            direct_actions_enabled: env_bool("WATTGATE_DIRECT_ACTIONS", false),
            cors_origins,
            cors_allow_credentials: env_bool("WATTGATE_CORS_ALLOW_CREDENTIALS", false),
            cors_max_age_secs: env_parse("WATTGATE_CORS_MAX_AGE_SECS", defaults.cors_max_age_secs),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Decode the session signing key.
    pub fn signing_key(&self) -> Result<SigningKey, ConfigError> {
        let secret = self
            .session_secret
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "WATTGATE_SESSION_SECRET".to_string(),
            })?;
        SigningKey::from_config(secret.expose_secret()).map_err(|e| match e {
            ConfigError::InvalidValue { reason, .. } => ConfigError::InvalidValue {
                field: "WATTGATE_SESSION_SECRET".to_string(),
                reason,
            },
            ConfigError::MissingRequired { .. } => ConfigError::MissingRequired {
                field: "WATTGATE_SESSION_SECRET".to_string(),
            },
        })
    }

    pub fn require_refresh_token(&self) -> Result<SecretString, ConfigError> {
        self.refresh_token
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "WATTGATE_REFRESH_TOKEN".to_string(),
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts, self.retry_base_delay)
    }

    /// Fail startup in production when a required secret is missing or weak.
    /// In development the problems are logged and the affected actions answer
    /// with a configuration error instead.
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        let signing = self.signing_key().map(|_| ());
        let refresh = self.require_refresh_token().map(|_| ());

        if !self.is_production() {
            for err in [signing.err(), refresh.err()].into_iter().flatten() {
                tracing::warn!(error = %err, "configuration incomplete (development)");
            }
            return Ok(());
        }

        signing?;
        refresh?;

        if self.redis_url.is_none() {
            tracing::warn!(
                "WATTGATE_REDIS_URL not set in production; locks and bindings are process-local"
            );
        }
        if self.direct_actions_enabled {
            return Err(ConfigError::InvalidValue {
                field: "WATTGATE_DIRECT_ACTIONS".to_string(),
                reason: "unauthenticated actions must not be enabled in production".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |s: &Option<SecretString>| if s.is_some() { "[REDACTED]" } else { "<unset>" };
        f.debug_struct("GatewayConfig")
            .field("environment", &self.environment)
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("upstream_base_url", &self.upstream_base_url)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("session_secret", &redact(&self.session_secret))
            .field("session_cookie", &self.session_cookie)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("utc_offset", &self.utc_offset)
            .field("direct_actions_enabled", &self.direct_actions_enabled)
            .field("cors_origins", &self.cors_origins)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let previous = std::env::var(key).ok();
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.previous.as_deref() {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    const SECRET: &str = "a-session-secret-that-is-long-enough-123456";

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.token_lifetime, Duration::from_secs(1200));
        assert_eq!(config.token_min_validity, Duration::from_secs(15));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(1000));
        assert_eq!(config.session_cookie, "wattgate_session");
        assert!(!config.direct_actions_enabled);
        assert!(!config.is_production());
    }

    #[test]
    fn test_from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let _base = EnvVarGuard::set("WATTGATE_UPSTREAM_BASE_URL", Some("http://localhost:9000/api/"));
        let _retry = EnvVarGuard::set("WATTGATE_RETRY_MAX_ATTEMPTS", Some("5"));
        let _cookie = EnvVarGuard::set("WATTGATE_SESSION_COOKIE", Some("sid"));
        let _direct = EnvVarGuard::set("WATTGATE_DIRECT_ACTIONS", Some("true"));
        let _port = EnvVarGuard::set("PORT", Some("8088"));
        let _bad = EnvVarGuard::set("WATTGATE_LOCK_TIMEOUT_MS", Some("soon"));
        let _offset = EnvVarGuard::set("WATTGATE_UTC_OFFSET_MINUTES", Some("120"));

        let config = GatewayConfig::from_env();
        assert_eq!(config.upstream_base_url, "http://localhost:9000/api");
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.session_cookie, "sid");
        assert!(config.direct_actions_enabled);
        assert_eq!(config.port, 8088);
        assert_eq!(config.lock_timeout, Duration::from_millis(500));
        assert_eq!(config.utc_offset, FixedOffset::east_opt(2 * 3600));
    }

    #[test]
    fn test_production_requires_secrets() {
        let mut config = GatewayConfig {
            environment: "production".to_string(),
            ..GatewayConfig::default()
        };
        assert!(matches!(
            config.validate_for_production(),
            Err(ConfigError::MissingRequired { .. })
        ));

        config.session_secret = Some(SecretString::from("short".to_string()));
        config.refresh_token = Some(SecretString::from("refresh".to_string()));
        assert!(matches!(
            config.validate_for_production(),
            Err(ConfigError::InvalidValue { .. })
        ));

        config.session_secret = Some(SecretString::from(SECRET.to_string()));
        assert!(config.validate_for_production().is_ok());

        config.direct_actions_enabled = true;
        assert!(config.validate_for_production().is_err());
    }

    #[test]
    fn test_development_tolerates_missing_secrets() {
        assert!(GatewayConfig::default().validate_for_production().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = GatewayConfig {
            session_secret: Some(SecretString::from(SECRET.to_string())),
            ..GatewayConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(SECRET));
        assert!(rendered.contains("[REDACTED]"));
    }
}
