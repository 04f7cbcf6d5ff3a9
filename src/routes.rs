//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded (bypassed for /health, /ready)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Deadline     │ ← 504/408 if the budget elapses (bypassed for probes)
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! Denied requests never reach the deadline executor, so they do not spawn
//! a guarded task.

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::state::AppState;
use crate::utils::duration_string;

/// Build the application router with all routes and middleware configured.
///
/// Layers are taken from `state`, so the router shares the limiter and the
/// deadline task tracker that `AppState::shutdown` stops.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/work", get(handlers::work));

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Deadline
    info!(
        timeout = %duration_string(state.timeout.config().timeout),
        status = %state.timeout.config().status_code,
        "Request deadline configured"
    );
    router = router.layer(state.timeout.clone());

    // 2. Rate Limiting (if enabled)
    match &state.rate_limit {
        Some(layer) => {
            info!(
                max = layer.config().max,
                window = %duration_string(layer.config().window),
                key = %config.rate_limit_key,
                trusted_proxies = config.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            router = router.layer(layer.clone());
        }
        None => info!("Rate limiting disabled (RATE_LIMIT_MAX=0)"),
    }

    // 3. Tracing
    router = router.layer(TraceLayer::new_for_http());

    router.with_state(state)
}
