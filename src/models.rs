//! Response and query types for the demo endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `draining` once shutdown has begun
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since the process started
    pub uptime_seconds: u64,
    /// Abandoned or running guarded tasks
    pub guarded_in_flight: usize,
    /// Live rate-limit buckets (absent when rate limiting is disabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_buckets: Option<usize>,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Query parameters for `GET /work`.
#[derive(Debug, Default, Deserialize)]
pub struct WorkParams {
    /// Simulated processing time in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

/// Response for `GET /work`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkResponse {
    pub delay_ms: u64,
    pub completed_at: DateTime<Utc>,
}
