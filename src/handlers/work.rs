//! Simulated workload endpoint.

use std::time::Duration;

use axum::Json;
use axum::extract::Query;
use chrono::Utc;
use tracing::instrument;

use crate::models::{WorkParams, WorkResponse};

/// Sleep for `delay_ms` and report completion.
///
/// Exercises the deadline middleware: a delay longer than
/// `REQUEST_TIMEOUT_MS` produces the timeout payload instead of this body.
#[instrument]
pub async fn work(Query(params): Query<WorkParams>) -> Json<WorkResponse> {
    if params.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
    }

    Json(WorkResponse {
        delay_ms: params.delay_ms,
        completed_at: Utc::now(),
    })
}
