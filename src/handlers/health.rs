//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness with guard statistics
//! - `GET /ready` - Kubernetes-compatible readiness probe
//!
//! Both paths bypass the deadline and the rate limiter so that probes keep
//! answering while the service is saturated.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Paths exempt from the guard middleware.
pub const PROBE_PATHS: [&str; 2] = ["/health", "/ready"];

pub fn is_probe_request(req: &Request<Body>) -> bool {
    PROBE_PATHS.contains(&req.uri().path())
}

/// Health check endpoint.
///
/// Always returns 200 OK with status details in the body.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "guarded_in_flight": 0,
///   "rate_limit_buckets": 3,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.is_ready() { "healthy" } else { "draining" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        guarded_in_flight: state.timeout.in_flight(),
        rate_limit_buckets: state.rate_limit.as_ref().map(|l| l.limiter().len()),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Returns 503 once shutdown has begun so load balancers stop routing here.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.is_ready() {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
