//! Shared application state for Axum handlers.
//!
//! Holds the configuration and the two guard layers. The layers are built
//! once here rather than inside the router so that their background work
//! (the limiter's eviction sweep, abandoned deadline tasks) can be stopped
//! from `main` after the server exits.
//!
//! # Structured Concurrency
//!
//! Readiness is tied to a `CancellationToken`: `shutdown()` cancels it first,
//! which flips `/ready` to 503, then stops the sweep and waits for abandoned
//! guarded tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::is_probe_request;
use crate::middleware::{RateLimitLayer, TimeoutLayer};
use crate::utils::duration_string;

/// Upper bound on how long shutdown waits for abandoned guarded tasks.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// Constructing the state spawns the limiter's sweep task, so it must be
/// created inside a tokio runtime. Call `shutdown()` before exit:
///
/// ```rust,ignore
/// let state = AppState::new(config);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone, Debug)]
pub struct AppState {
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Application configuration
    pub config: Arc<Config>,
    /// Deadline middleware shared by every route
    pub timeout: TimeoutLayer,
    /// Rate limiter, `None` when `RATE_LIMIT_MAX=0`
    pub rate_limit: Option<RateLimitLayer>,
    /// Cancelled when shutdown begins
    shutting_down: CancellationToken,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// Health and readiness probes are exempted from both guards.
    pub fn new(config: Config) -> Self {
        let timeout = TimeoutLayer::with_config(config.timeout_config().with_skip(is_probe_request));

        let rate_limit = config
            .rate_limit_config()
            .map(|limit| RateLimitLayer::with_config(limit.with_skip(is_probe_request)));

        Self {
            started_at: Instant::now(),
            config: Arc::new(config),
            timeout,
            rate_limit,
            shutting_down: CancellationToken::new(),
        }
    }

    /// Whether the service should receive new traffic.
    pub fn is_ready(&self) -> bool {
        !self.shutting_down.is_cancelled()
    }

    /// Gracefully shutdown background work.
    ///
    /// This method:
    /// 1. Marks the service as not ready
    /// 2. Stops the rate limiter's sweep task
    /// 3. Waits (bounded by [`DRAIN_TIMEOUT`]) for abandoned guarded tasks
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.shutting_down.cancel();

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.shutdown().await;
        }

        let in_flight = self.timeout.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for abandoned guarded tasks");
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.timeout.drain())
            .await
            .is_err()
        {
            warn!(
                remaining = self.timeout.in_flight(),
                waited = %duration_string(DRAIN_TIMEOUT),
                "Guarded tasks still running at shutdown"
            );
        }

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
