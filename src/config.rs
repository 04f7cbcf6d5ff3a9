//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Request Deadline
//!
//! - `REQUEST_TIMEOUT_MS`: Budget for every guarded request (default: 30000)
//! - `TIMEOUT_STATUS`: `gateway` (504), `client` (408) or a numeric status code
//! - `TIMEOUT_MESSAGE`: Error text in the timeout payload
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_MAX`: Requests per key per window (default: 100, 0 = disabled)
//! - `RATE_LIMIT_WINDOW_SECS`: Window length (default: 60)
//! - `RATE_LIMIT_HEADERS`: Attach `X-RateLimit-*` headers (default: true)
//! - `RATE_LIMIT_KEY`: `ip`, `user` or `api-key:<header>` (default: `ip`)
//! - `TRUSTED_PROXIES`: Comma-separated CIDR ranges allowed to set `X-Forwarded-For`

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderName, StatusCode};
use tracing::warn;

use crate::error::{GuardError, GuardResult};
use crate::middleware::rate_limit::{KeyExtractor, MAX_WINDOW, RateLimitConfig};
use crate::middleware::timeout::{DEFAULT_TIMEOUT_MESSAGE, MAX_TIMEOUT, TimeoutConfig};

/// How the rate limiter derives its bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitKey {
    /// Peer IP (or forwarded client IP from trusted proxies).
    Ip,
    /// Authenticated user id, falling back to the peer IP.
    User,
    /// Value of the named header, falling back to the peer IP.
    ApiKey(HeaderName),
}

impl RateLimitKey {
    /// Parse `ip`, `user` or `api-key:<header>`.
    ///
    /// Unrecognised values fall back to [`RateLimitKey::Ip`] with a warning
    /// rather than failing startup.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "ip" => return Self::Ip,
            "user" => return Self::User,
            _ => {}
        }

        if let Some((kind, header)) = value.split_once(':')
            && kind.eq_ignore_ascii_case("api-key")
        {
            match HeaderName::try_from(header.trim()) {
                Ok(name) => return Self::ApiKey(name),
                Err(e) => warn!(header = %header, error = %e, "Invalid RATE_LIMIT_KEY header name"),
            }
        }

        warn!(value = %value, "Unrecognised RATE_LIMIT_KEY, keying on client IP");
        Self::Ip
    }

    fn extractor(&self) -> KeyExtractor {
        match self {
            Self::Ip => KeyExtractor::peer_addr(),
            Self::User => KeyExtractor::user(),
            Self::ApiKey(header) => KeyExtractor::api_key(header.clone()),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::User => f.write_str("user"),
            Self::ApiKey(header) => write!(f, "api-key:{header}"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Request Deadline Configuration
    // =========================================================================
    /// Time budget for guarded requests (default: 30 seconds)
    pub request_timeout: Duration,

    /// Status returned when the budget elapses (default: 504)
    pub timeout_status: StatusCode,

    /// Message placed in the timeout payload
    pub timeout_message: String,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests per key per window (default: 100)
    /// Set to 0 to disable rate limiting
    pub rate_limit_max: u32,

    /// Fixed window length (default: 60 seconds)
    pub rate_limit_window: Duration,

    /// Attach `X-RateLimit-*` headers to guarded responses (default: true)
    pub rate_limit_headers: bool,

    /// Bucket key strategy (default: client IP)
    pub rate_limit_key: RateLimitKey,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// X-Forwarded-For headers are only used when the connection originates
    /// from one of these networks. Empty means forwarded headers are ignored.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::Config` if a value cannot be parsed or fails
    /// validation.
    pub fn from_env() -> GuardResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Request deadline
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 30_000)?),
            timeout_status: match env::var("TIMEOUT_STATUS") {
                Ok(value) => parse_timeout_status(&value)?,
                Err(_) => StatusCode::GATEWAY_TIMEOUT,
            },
            timeout_message: env::var("TIMEOUT_MESSAGE")
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_TIMEOUT_MESSAGE.to_string()),

            // Rate limiting
            rate_limit_max: Self::parse_env("RATE_LIMIT_MAX", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_headers: Self::parse_env("RATE_LIMIT_HEADERS", true)?,
            rate_limit_key: env::var("RATE_LIMIT_KEY")
                .map(|v| RateLimitKey::parse(&v))
                .unwrap_or(RateLimitKey::Ip),
            trusted_proxies: parse_list(&env::var("TRUSTED_PROXIES").unwrap_or_default()),

            // Observability
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::Config` if validation fails.
    fn validate(&self) -> GuardResult<()> {
        if self.request_timeout.is_zero() {
            return Err(GuardError::Config(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout > MAX_TIMEOUT {
            return Err(GuardError::Config(format!(
                "REQUEST_TIMEOUT_MS must be at most {}",
                MAX_TIMEOUT.as_millis()
            )));
        }

        if self.rate_limiting_enabled() && self.rate_limit_window.is_zero() {
            return Err(GuardError::Config(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.rate_limiting_enabled() && self.rate_limit_window > MAX_WINDOW {
            return Err(GuardError::Config(format!(
                "RATE_LIMIT_WINDOW_SECS must be at most {}",
                MAX_WINDOW.as_secs()
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max > 0
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Deadline middleware configuration.
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::gateway()
            .with_timeout(self.request_timeout)
            .with_status(self.timeout_status)
            .with_message(self.timeout_message.clone())
    }

    /// Rate limit middleware configuration, or `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limiting_enabled().then(|| {
            RateLimitConfig::new(self.rate_limit_max, self.rate_limit_window)
                .with_key(self.rate_limit_key.extractor())
                .with_headers(self.rate_limit_headers)
                .with_trusted_proxies(self.trusted_proxies.clone())
        })
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GuardResult<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GuardError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Parse `TIMEOUT_STATUS`: `gateway`, `client` or a numeric code.
fn parse_timeout_status(value: &str) -> GuardResult<StatusCode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "gateway" => Ok(StatusCode::GATEWAY_TIMEOUT),
        "client" => Ok(StatusCode::REQUEST_TIMEOUT),
        other => other
            .parse::<u16>()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| {
                GuardError::Config(format!(
                    "Invalid TIMEOUT_STATUS: {value} (expected gateway, client or a status code)"
                ))
            }),
    }
}

/// Split a comma-separated list, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Request deadline
            request_timeout: Duration::from_secs(30),
            timeout_status: StatusCode::GATEWAY_TIMEOUT,
            timeout_message: DEFAULT_TIMEOUT_MESSAGE.to_string(),
            // Rate limiting
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_headers: true,
            rate_limit_key: RateLimitKey::Ip,
            trusted_proxies: vec![],
            // Observability
            metrics_port: 9090,
        }
    }
}
