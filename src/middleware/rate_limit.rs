//! Per-key rate limiting middleware.
//!
//! # Algorithm
//!
//! Fixed windows per key, backed by [`TokenBucketLimiter`]. Each key gets
//! `max` admissions per `window`; the window restarts lazily on the first
//! request after it expires, and idle keys are evicted in the background.
//!
//! # Keys
//!
//! The key is produced by a [`KeyExtractor`]. The default is the peer IP
//! recorded by `into_make_service_with_connect_info`. Other extractors key
//! on an API key header, on an [`AuthenticatedUser`] extension, or on an
//! arbitrary function.
//!
//! # Response Headers
//!
//! When `headers` is enabled, every guarded response carries:
//! - `X-RateLimit-Limit`: configured `max`
//! - `X-RateLimit-Remaining`: admissions left in the current window
//! - `X-RateLimit-Reset`: unix timestamp (seconds) when the window ends
//!
//! Denied requests always carry `Retry-After` (whole seconds).
//!
//! # IP Spoofing Mitigation
//!
//! `X-Forwarded-For` and `X-Real-IP` are only honoured when the connected
//! peer falls inside `trusted_proxies`. With an empty list they are ignored
//! entirely, so a client cannot pick its own bucket by sending the header.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{TrustedProxyConfig, client_ip_with_trusted_proxies, peer_key};
use super::limiter::{Admission, TokenBucketLimiter, normalize_quota, whole_secs_ceil};
use super::timeout::SkipFn;
use crate::metrics;
use crate::utils::duration_string;

pub use super::limiter::{DEFAULT_MAX, DEFAULT_WINDOW, MAX_WINDOW};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

// =============================================================================
// Key Extraction
// =============================================================================

/// Identity of an authenticated caller, inserted as a request extension by
/// whatever authentication layer runs before the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Derives the bucket key for a request.
#[derive(Clone)]
pub struct KeyExtractor {
    extract: Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>,
    kind: &'static str,
}

impl KeyExtractor {
    /// Peer IP, or `"unknown"` when the server did not record connect info.
    pub fn peer_addr() -> Self {
        Self {
            extract: Arc::new(|req: &Request<Body>| peer_key(req).into_owned()),
            kind: "peer_addr",
        }
    }

    /// Client IP from forwarded headers, honoured only from trusted peers.
    pub fn trusted_proxies(proxies: TrustedProxyConfig) -> Self {
        Self {
            extract: Arc::new(move |req: &Request<Body>| {
                client_ip_with_trusted_proxies(req, &proxies).into_owned()
            }),
            kind: "trusted_proxies",
        }
    }

    /// `apikey:<value>` from the named header, falling back to the peer IP.
    pub fn api_key(header: HeaderName) -> Self {
        Self {
            extract: Arc::new(move |req: &Request<Body>| {
                match req.headers().get(&header).and_then(|v| v.to_str().ok()) {
                    Some(key) if !key.is_empty() => format!("apikey:{key}"),
                    _ => peer_key(req).into_owned(),
                }
            }),
            kind: "api_key",
        }
    }

    /// `user:<id>` from the [`AuthenticatedUser`] extension, falling back to
    /// the peer IP.
    pub fn user() -> Self {
        Self {
            extract: Arc::new(|req: &Request<Body>| match req.extensions().get::<AuthenticatedUser>() {
                Some(AuthenticatedUser(id)) if !id.is_empty() => format!("user:{id}"),
                _ => peer_key(req).into_owned(),
            }),
            kind: "user",
        }
    }

    pub fn custom<F>(extract: F) -> Self
    where
        F: Fn(&Request<Body>) -> String + Send + Sync + 'static,
    {
        Self {
            extract: Arc::new(extract),
            kind: "custom",
        }
    }

    pub fn extract(&self, req: &Request<Body>) -> String {
        (self.extract)(req)
    }
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::peer_addr()
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyExtractor").field(&self.kind).finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Admissions per key per window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
    pub key: KeyExtractor,
    /// Message placed in the `error` field of the denial payload.
    /// Empty means a message derived from `max` and `window`.
    pub error_message: String,
    pub status_code: StatusCode,
    /// Requests matching this predicate bypass the limiter.
    pub skip: Option<SkipFn>,
    /// Attach `X-RateLimit-*` headers.
    pub headers: bool,
    /// CIDR ranges of reverse proxies whose forwarded headers are honoured.
    /// When non-empty, replaces `key` with [`KeyExtractor::trusted_proxies`].
    pub trusted_proxies: Vec<String>,
}

impl RateLimitConfig {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: KeyExtractor) -> Self {
        self.key = key;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_status(mut self, status_code: StatusCode) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_trusted_proxies(mut self, cidrs: Vec<String>) -> Self {
        self.trusted_proxies = cidrs;
        self
    }

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    fn normalized(mut self) -> Self {
        (self.max, self.window) = normalize_quota(self.max, self.window);
        if self.error_message.is_empty() {
            self.error_message = format!(
                "Rate limit exceeded. Maximum {} requests per {}",
                self.max,
                duration_string(self.window)
            );
        }
        if !self.trusted_proxies.is_empty() {
            let proxies = TrustedProxyConfig::new(&self.trusted_proxies);
            if proxies.is_enabled() {
                debug!(replaced = ?self.key, "Trusted proxies configured, keying on forwarded client IP");
                self.key = KeyExtractor::trusted_proxies(proxies);
            } else {
                warn!(
                    configured = ?self.trusted_proxies,
                    "No valid trusted proxy CIDR, keeping the configured key extractor"
                );
            }
        }
        self
    }

    fn should_skip(&self, req: &Request<Body>) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(req))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            window: DEFAULT_WINDOW,
            key: KeyExtractor::default(),
            error_message: String::new(),
            status_code: StatusCode::TOO_MANY_REQUESTS,
            skip: None,
            headers: true,
            trusted_proxies: Vec::new(),
        }
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("max", &self.max)
            .field("window", &self.window)
            .field("key", &self.key)
            .field("error_message", &self.error_message)
            .field("status_code", &self.status_code)
            .field("skip", &self.skip.is_some())
            .field("headers", &self.headers)
            .field("trusted_proxies", &self.trusted_proxies)
            .finish()
    }
}

// =============================================================================
// Layer
// =============================================================================

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::per_minute(60);
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(layer);
/// ```
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    config: Arc<RateLimitConfig>,
    limiter: TokenBucketLimiter,
}

impl RateLimitLayer {
    /// `max` requests per `window` per peer IP.
    pub fn new(max: u32, window: Duration) -> Self {
        Self::with_config(RateLimitConfig::new(max, window))
    }

    pub fn per_second(max: u32) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    pub fn per_minute(max: u32) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    pub fn per_hour(max: u32) -> Self {
        Self::new(max, Duration::from_secs(3600))
    }

    /// Limit per authenticated user. See [`KeyExtractor::user`].
    pub fn by_user(max: u32, window: Duration) -> Self {
        Self::with_config(RateLimitConfig::new(max, window).with_key(KeyExtractor::user()))
    }

    /// Limit per API key carried in `header`. See [`KeyExtractor::api_key`].
    pub fn by_api_key(max: u32, window: Duration, header: HeaderName) -> Self {
        Self::with_config(RateLimitConfig::new(max, window).with_key(KeyExtractor::api_key(header)))
    }

    /// Build from a full configuration. Unusable values are replaced with
    /// defaults and logged.
    ///
    /// Spawns the limiter's eviction task, so this should be called from
    /// within a tokio runtime.
    pub fn with_config(config: RateLimitConfig) -> Self {
        let config = config.normalized();
        let limiter = TokenBucketLimiter::new(config.max, config.window);
        Self {
            config: Arc::new(config),
            limiter,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    /// Stop the background eviction task.
    pub async fn shutdown(&self) {
        self.limiter.shutdown().await;
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            config: self.config.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<RateLimitConfig>,
    limiter: TokenBucketLimiter,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if self.config.should_skip(&req) {
            debug!(path = %req.uri().path(), "Rate limit skipped for request");
            return Box::pin(self.inner.call(req));
        }

        let key = self.config.key.extract(&req);
        let admission = self.limiter.admit(&key);
        let config = self.config.clone();

        if !admission.allowed {
            let reset = WindowReset::of(&admission);
            warn!(
                key = %key,
                path = %req.uri().path(),
                retry_after_secs = reset.retry_after_secs(),
                "Rate limit exceeded"
            );
            metrics::record_rate_limited();

            return Box::pin(async move {
                Ok::<_, S::Error>(denied_response(&config, &admission, &reset))
            });
        }

        debug!(key = %key, remaining = admission.remaining, "Request admitted");

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if config.headers {
                let reset = WindowReset::of(&admission);
                insert_limit_headers(response.headers_mut(), config.max, &admission, &reset);
            }
            Ok(response)
        })
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Serialize)]
struct RateLimitBody<'a> {
    error: &'a str,
    limit: u32,
    window: String,
    #[serde(rename = "retryAt")]
    retry_at: String,
}

/// End of an admission's window, read once so every header and the body
/// describe the same instant.
#[derive(Debug, Clone, Copy)]
struct WindowReset {
    wait: Duration,
    at: DateTime<Utc>,
}

impl WindowReset {
    fn of(admission: &Admission) -> Self {
        let wait = admission.retry_after();
        let until_reset = TimeDelta::from_std(wait).unwrap_or(TimeDelta::zero());
        Self {
            wait,
            at: Utc::now() + until_reset,
        }
    }

    fn retry_after_secs(&self) -> u64 {
        whole_secs_ceil(self.wait)
    }
}

fn insert_limit_headers(
    headers: &mut HeaderMap,
    max: u32,
    admission: &Admission,
    reset: &WindowReset,
) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(max));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(admission.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset.at.timestamp()));
}

fn denied_response(
    config: &RateLimitConfig,
    admission: &Admission,
    reset: &WindowReset,
) -> Response<Body> {
    let body = RateLimitBody {
        error: &config.error_message,
        limit: config.max,
        window: duration_string(config.window),
        retry_at: reset.at.to_rfc3339_opts(SecondsFormat::Secs, true),
    };

    let mut response = (config.status_code, Json(body)).into_response();
    let headers = response.headers_mut();
    if config.headers {
        insert_limit_headers(headers, config.max, admission, reset);
    }
    headers.insert(RETRY_AFTER, HeaderValue::from(reset.retry_after_secs()));

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::extract::ConnectInfo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn request_from(peer: &str) -> axum::http::request::Builder {
        let addr: SocketAddr = peer.parse().unwrap();
        Request::builder().uri("/").extension(ConnectInfo(addr))
    }

    fn ok_service()
    -> impl Service<Request<Body>, Response = Response<Body>, Error = Infallible, Future: Send + 'static>
    + Clone
    + Send
    + 'static {
        tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        })
    }

    async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max, DEFAULT_MAX);
        assert_eq!(config.window, DEFAULT_WINDOW);
        assert_eq!(config.status_code, StatusCode::TOO_MANY_REQUESTS);
        assert!(config.headers);
        assert!(config.trusted_proxies.is_empty());
    }

    #[test]
    fn test_normalize_replaces_zero_values_and_fills_message() {
        let config = RateLimitConfig::new(0, Duration::ZERO).normalized();
        assert_eq!(config.max, 100);
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(
            config.error_message,
            "Rate limit exceeded. Maximum 100 requests per 1m0s"
        );
    }

    #[test]
    fn test_normalize_keeps_custom_message() {
        let config = RateLimitConfig::new(5, Duration::from_secs(1))
            .with_message("slow down")
            .normalized();
        assert_eq!(config.error_message, "slow down");
    }

    #[test]
    fn test_trusted_proxies_replace_key_extractor() {
        let config = RateLimitConfig::new(5, Duration::from_secs(1))
            .with_key(KeyExtractor::user())
            .with_trusted_proxies(vec!["10.0.0.0/8".to_string()])
            .normalized();
        assert_eq!(config.key.kind, "trusted_proxies");
    }

    #[test]
    fn test_invalid_trusted_proxies_keep_key_extractor() {
        let config = RateLimitConfig::new(5, Duration::from_secs(1))
            .with_key(KeyExtractor::user())
            .with_trusted_proxies(vec!["not-a-cidr".to_string()])
            .normalized();
        assert_eq!(config.key.kind, "user");
    }

    #[test]
    fn test_normalize_caps_long_window() {
        let config = RateLimitConfig::new(1, Duration::from_secs(u64::MAX)).normalized();
        assert_eq!(config.window, MAX_WINDOW);
        assert_eq!(
            config.error_message,
            "Rate limit exceeded. Maximum 1 requests per 8760h0m0s"
        );
    }

    #[tokio::test]
    async fn test_huge_window_admits_without_overflow() {
        let layer = RateLimitLayer::new(1, Duration::from_secs(u64::MAX));
        assert!(layer.limiter().admit("k").allowed);

        let service = layer.layer(ok_service());
        let response = service
            .clone()
            .oneshot(request_from("10.1.1.9:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        layer.shutdown().await;
    }

    #[test]
    fn test_peer_addr_key_drops_port() {
        let req = request_from("192.168.1.7:51234").body(Body::empty()).unwrap();
        assert_eq!(KeyExtractor::peer_addr().extract(&req), "192.168.1.7");
    }

    #[test]
    fn test_peer_addr_key_without_connect_info() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(KeyExtractor::peer_addr().extract(&req), "unknown");
    }

    #[test]
    fn test_api_key_extractor() {
        let extractor = KeyExtractor::api_key(HeaderName::from_static("x-api-key"));

        let with_key = request_from("1.2.3.4:1000")
            .header("x-api-key", "secret-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extractor.extract(&with_key), "apikey:secret-123");

        let without_key = request_from("1.2.3.4:1000").body(Body::empty()).unwrap();
        assert_eq!(extractor.extract(&without_key), "1.2.3.4");
    }

    #[test]
    fn test_user_extractor() {
        let extractor = KeyExtractor::user();

        let authenticated = request_from("1.2.3.4:1000")
            .extension(AuthenticatedUser("alice".to_string()))
            .body(Body::empty())
            .unwrap();
        assert_eq!(extractor.extract(&authenticated), "user:alice");

        let anonymous = request_from("1.2.3.4:1000").body(Body::empty()).unwrap();
        assert_eq!(extractor.extract(&anonymous), "1.2.3.4");
    }

    #[test]
    fn test_custom_extractor() {
        let extractor = KeyExtractor::custom(|req| req.uri().path().to_string());
        let req = Request::builder().uri("/tenant/7").body(Body::empty()).unwrap();
        assert_eq!(extractor.extract(&req), "/tenant/7");
    }

    #[tokio::test]
    async fn test_allowed_responses_carry_limit_headers() {
        let layer = RateLimitLayer::new(2, Duration::from_secs(60));
        let service = layer.layer(ok_service());

        let response = service
            .clone()
            .oneshot(request_from("10.1.1.1:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(X_RATELIMIT_LIMIT).unwrap(), "2");
        assert_eq!(response.headers().get(X_RATELIMIT_REMAINING).unwrap(), "1");
        let reset: i64 = response
            .headers()
            .get(X_RATELIMIT_RESET)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset >= Utc::now().timestamp());
        assert!(response.headers().get(RETRY_AFTER).is_none());

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_denial_payload_and_headers() {
        let layer = RateLimitLayer::new(1, Duration::from_secs(30));
        let service = layer.layer(ok_service());

        let first = service
            .clone()
            .oneshot(request_from("10.1.1.2:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = service
            .clone()
            .oneshot(request_from("10.1.1.2:4001").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        let retry_after: u64 = denied
            .headers()
            .get(RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after <= 30);
        assert_eq!(denied.headers().get(X_RATELIMIT_REMAINING).unwrap(), "0");

        let body = json_body(denied).await;
        assert_eq!(body["error"], "Rate limit exceeded. Maximum 1 requests per 30s");
        assert_eq!(body["limit"], 1);
        assert_eq!(body["window"], "30s");
        let retry_at = body["retryAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(retry_at).is_ok());
        assert!(retry_at.ends_with('Z'));

        layer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_rounds_partial_seconds_up() {
        let layer = RateLimitLayer::new(1, Duration::from_secs(1));
        let service = layer.layer(ok_service());

        service
            .clone()
            .oneshot(request_from("10.1.1.5:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let denied = service
            .clone()
            .oneshot(request_from("10.1.1.5:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers().get(RETRY_AFTER).unwrap(), "1");

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_header_matches_retry_at() {
        let layer = RateLimitLayer::new(1, Duration::from_secs(30));
        let service = layer.layer(ok_service());

        service
            .clone()
            .oneshot(request_from("10.1.1.6:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let denied = service
            .clone()
            .oneshot(request_from("10.1.1.6:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let reset: i64 = denied
            .headers()
            .get(X_RATELIMIT_RESET)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = json_body(denied).await;
        let retry_at = DateTime::parse_from_rfc3339(body["retryAt"].as_str().unwrap()).unwrap();
        assert_eq!(retry_at.timestamp(), reset);

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_headers_disabled_still_sends_retry_after() {
        let layer = RateLimitLayer::with_config(
            RateLimitConfig::new(1, Duration::from_secs(10)).with_headers(false),
        );
        let service = layer.layer(ok_service());

        let allowed = service
            .clone()
            .oneshot(request_from("10.1.1.3:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(allowed.headers().get(X_RATELIMIT_LIMIT).is_none());

        let denied = service
            .clone()
            .oneshot(request_from("10.1.1.3:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(denied.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert!(denied.headers().get(RETRY_AFTER).is_some());

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_status_code() {
        let layer = RateLimitLayer::with_config(
            RateLimitConfig::new(1, Duration::from_secs(10))
                .with_status(StatusCode::SERVICE_UNAVAILABLE),
        );
        let service = layer.layer(ok_service());

        service
            .clone()
            .oneshot(request_from("10.1.1.4:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let denied = service
            .clone()
            .oneshot(request_from("10.1.1.4:4000").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::SERVICE_UNAVAILABLE);

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_predicate_bypasses_limiter() {
        let layer = RateLimitLayer::with_config(
            RateLimitConfig::new(1, Duration::from_secs(60))
                .with_skip(|req| req.uri().path() == "/health"),
        );
        let service = layer.layer(ok_service());

        for _ in 0..5 {
            let response = service
                .clone()
                .oneshot(
                    request_from("10.1.1.5:4000")
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
        assert!(layer.limiter().is_empty());

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_keys_are_limited_independently() {
        let layer = RateLimitLayer::per_minute(1);
        let service = layer.layer(ok_service());

        for peer in ["10.2.0.1:1", "10.2.0.2:1", "10.2.0.3:1"] {
            let response = service
                .clone()
                .oneshot(request_from(peer).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(layer.limiter().len(), 3);

        layer.shutdown().await;
    }

    #[tokio::test]
    async fn test_by_api_key_shares_bucket_across_peers() {
        let layer =
            RateLimitLayer::by_api_key(1, Duration::from_secs(60), HeaderName::from_static("x-api-key"));
        let service = layer.layer(ok_service());

        let first = service
            .clone()
            .oneshot(
                request_from("10.3.0.1:1")
                    .header("x-api-key", "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = service
            .clone()
            .oneshot(
                request_from("10.3.0.2:1")
                    .header("x-api-key", "k1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        layer.shutdown().await;
    }
}
