//! Prometheus metrics for the guard middleware.
//!
//! Metrics are exposed via a dedicated HTTP endpoint when an exporter is
//! installed with [`init_metrics`]. Without one, every recording function is
//! a cheap no-op, so the middleware can be used as a library without any
//! metrics setup.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `guard_requests_timed_out_total` - Requests answered with the synthesized timeout response
//! - `guard_requests_cancelled_total` - Requests abandoned because of external cancellation
//! - `guard_downstream_faults_total` - Panics / errors contained at the task boundary (label: kind)
//! - `guard_rate_limited_total` - Requests denied by the rate limiter
//!
//! ## Histograms
//! - `guard_guarded_duration_seconds` - Time spent waiting on the deadline race (label: outcome)
//!
//! ## Gauges
//! - `guard_rate_limit_buckets` - Live buckets in the rate limiter directory

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TIMED_OUT_TOTAL: &str = "guard_requests_timed_out_total";
    pub const REQUESTS_CANCELLED_TOTAL: &str = "guard_requests_cancelled_total";
    pub const DOWNSTREAM_FAULTS_TOTAL: &str = "guard_downstream_faults_total";
    pub const RATE_LIMITED_TOTAL: &str = "guard_rate_limited_total";
    pub const GUARDED_DURATION_SECONDS: &str = "guard_guarded_duration_seconds";
    pub const RATE_LIMIT_BUCKETS: &str = "guard_rate_limit_buckets";
}

/// Initialize the Prometheus metrics exporter on `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::REQUESTS_TIMED_OUT_TOTAL,
        "Requests that exceeded their deadline and received a timeout response"
    );
    describe_counter!(
        names::REQUESTS_CANCELLED_TOTAL,
        "Requests abandoned because an external cancellation fired first"
    );
    describe_counter!(
        names::DOWNSTREAM_FAULTS_TOTAL,
        "Downstream panics or errors contained inside guarded tasks"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests denied by the fixed-window rate limiter"
    );
    describe_histogram!(
        names::GUARDED_DURATION_SECONDS,
        "Time the caller waited for a deadline-bounded execution to resolve"
    );
    describe_gauge!(
        names::RATE_LIMIT_BUCKETS,
        "Number of rate-limit buckets currently held in memory"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_timeout() {
    counter!(names::REQUESTS_TIMED_OUT_TOTAL).increment(1);
}

pub fn record_cancelled() {
    counter!(names::REQUESTS_CANCELLED_TOTAL).increment(1);
}

/// Record a fault contained at the task boundary.
///
/// `kind` is one of `panic`, `service_error` or `body_error`.
pub fn record_downstream_fault(kind: &'static str) {
    counter!(names::DOWNSTREAM_FAULTS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Record how long the caller waited for the deadline race.
pub fn record_guarded_duration(outcome: &'static str, duration_secs: f64) {
    histogram!(names::GUARDED_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

pub fn set_bucket_count(count: usize) {
    gauge!(names::RATE_LIMIT_BUCKETS).set(count as f64);
}
