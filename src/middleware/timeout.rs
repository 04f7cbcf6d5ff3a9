//! Deadline-bounded request execution.
//!
//! The downstream chain runs on its own task against a request it owns
//! outright and a [`BufferedResponse`] it fills privately. The caller races
//! that task's completion signal against the deadline and builds exactly one
//! response from whichever side wins:
//!
//! ```text
//!                ┌────────────── spawned task ──────────────┐
//! Request ──move──► inner.call(req) ─► BufferedResponse::collect ─► oneshot
//!                └───────────────────────────────────────────┘      │
//!                                                                   ▼
//!  caller:  select! { completion ─► buffered.into_response()            }
//!                   { deadline   ─► {"error": ..., "timeout": "100ms"} }
//!                   { cancelled  ─► empty body, configured status       }
//! ```
//!
//! # Abandoned Tasks
//!
//! Tokio has no way to kill a task that is not polled at a yield point, and a
//! blocking handler would not yield anyway. After the deadline the task is
//! simply abandoned: it keeps running against its own request and buffer,
//! and when it finishes the send on the completion channel fails because the
//! receiver is gone. Nothing it wrote is ever read again. Abandoned tasks
//! are tracked so a graceful shutdown can wait for them ([`TimeoutLayer::drain`]).
//!
//! # Faults
//!
//! A panic, an inner service error or a failing body stream is caught at the
//! task boundary, logged and counted. The completion signal is then never
//! sent, so the caller receives the timeout response once the deadline
//! passes.
//!
//! # External Cancellation
//!
//! If an upstream layer inserts a [`CancellationToken`] into the request
//! extensions (for example a shutdown token), firing it ends the wait early.
//! Only genuine expiry synthesizes the JSON timeout payload; a cancelled
//! request gets the configured status with an empty body.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::buffered::BufferedResponse;
use crate::metrics;
use crate::utils::duration_string;

/// Budget used when none (or a zero budget) is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted budget (365 days). Longer budgets, `Duration::MAX`
/// included, are capped to it.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Error text used when none is configured.
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "Request timeout";

/// Predicate deciding whether a request bypasses the deadline entirely.
pub type SkipFn = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for [`TimeoutLayer`].
#[derive(Clone)]
pub struct TimeoutConfig {
    /// Time budget for the downstream chain.
    pub timeout: Duration,
    /// Message placed in the `error` field of the timeout payload.
    pub error_message: String,
    /// Status of the timeout response.
    pub status_code: StatusCode,
    /// Requests matching this predicate are passed through without a deadline.
    pub skip: Option<SkipFn>,
}

impl TimeoutConfig {
    /// Gateway-style posture: `504 Gateway Timeout`.
    pub fn gateway() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            error_message: DEFAULT_TIMEOUT_MESSAGE.to_string(),
            status_code: StatusCode::GATEWAY_TIMEOUT,
            skip: None,
        }
    }

    /// Client-facing posture: `408 Request Timeout`.
    pub fn client_facing() -> Self {
        Self {
            status_code: StatusCode::REQUEST_TIMEOUT,
            ..Self::gateway()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    /// Replace unusable values with defaults instead of rejecting them.
    ///
    /// A zero budget would time out every request, so it is clamped back to
    /// [`DEFAULT_TIMEOUT`]. Budgets above [`MAX_TIMEOUT`] are capped.
    fn normalized(mut self) -> Self {
        self.timeout = normalize_budget(self.timeout);
        if self.error_message.is_empty() {
            self.error_message = DEFAULT_TIMEOUT_MESSAGE.to_string();
        }
        self
    }

    fn should_skip(&self, req: &Request<Body>) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(req))
    }
}

fn normalize_budget(budget: Duration) -> Duration {
    if budget.is_zero() {
        warn!(
            default = %duration_string(DEFAULT_TIMEOUT),
            "Zero request timeout configured, using default"
        );
        DEFAULT_TIMEOUT
    } else if budget > MAX_TIMEOUT {
        warn!(
            configured_secs = budget.as_secs(),
            max = %duration_string(MAX_TIMEOUT),
            "Request timeout too long, capping"
        );
        MAX_TIMEOUT
    } else {
        budget
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::gateway()
    }
}

impl fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("timeout", &self.timeout)
            .field("error_message", &self.error_message)
            .field("status_code", &self.status_code)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

// =============================================================================
// Deadline Executor
// =============================================================================

/// How a deadline-bounded execution resolved.
#[derive(Debug)]
pub enum Outcome {
    /// The downstream chain finished first; this is what it produced.
    Completed(BufferedResponse),
    /// The deadline elapsed first.
    TimedOut,
    /// An external cancellation fired before either of the above.
    Cancelled,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// A failure inside the guarded continuation.
///
/// Never reaches the client; it is logged and the completion signal is
/// withheld.
#[derive(Debug, Error)]
pub enum DownstreamFault {
    #[error("inner service failed: {0}")]
    Service(String),

    #[error("response body failed: {0}")]
    Body(#[from] axum::Error),
}

impl DownstreamFault {
    fn kind(&self) -> &'static str {
        match self {
            DownstreamFault::Service(_) => "service_error",
            DownstreamFault::Body(_) => "body_error",
        }
    }
}

/// Runs continuations on tracked background tasks under a time budget.
///
/// Cloning is cheap; clones share the same task tracker.
#[derive(Clone, Debug)]
pub struct DeadlineExecutor {
    budget: Duration,
    tasks: TaskTracker,
}

impl DeadlineExecutor {
    /// Create an executor. A zero budget is clamped to [`DEFAULT_TIMEOUT`]
    /// and anything above [`MAX_TIMEOUT`] is capped.
    pub fn new(budget: Duration) -> Self {
        Self {
            budget: normalize_budget(budget),
            tasks: TaskTracker::new(),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Number of guarded tasks still running, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Run `continuation` on its own task and race it against the deadline.
    ///
    /// The continuation is moved into the task, so everything it touches is
    /// owned by it alone. Whatever happens inside it, this call resolves with
    /// exactly one [`Outcome`].
    pub async fn execute<F>(&self, continuation: F, cancel: Option<CancellationToken>) -> Outcome
    where
        F: Future<Output = Result<BufferedResponse, DownstreamFault>> + Send + 'static,
    {
        let deadline = Instant::now() + self.budget;
        let (done_tx, done_rx) = oneshot::channel();

        self.tasks.spawn(async move {
            match AssertUnwindSafe(continuation).catch_unwind().await {
                Ok(Ok(buffered)) => {
                    if done_tx.send(buffered).is_err() {
                        debug!("Guarded task finished after its caller stopped waiting, discarding");
                    }
                }
                Ok(Err(fault)) => {
                    warn!(error = %fault, "Guarded task failed, response withheld");
                    metrics::record_downstream_fault(fault.kind());
                }
                Err(payload) => {
                    warn!(
                        panic = panic_message(payload.as_ref()),
                        "Guarded task panicked, contained at task boundary"
                    );
                    metrics::record_downstream_fault("panic");
                }
            }
        });

        // A dropped sender means the task faulted; that is indistinguishable
        // from a task that never finishes.
        let completion = async move {
            match done_rx.await {
                Ok(buffered) => buffered,
                Err(_) => std::future::pending().await,
            }
        };

        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        race(completion, deadline, cancelled).await
    }

    /// Wait for every guarded task, abandoned ones included, to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Resolve whichever side finishes first. When several are ready on the
/// same poll, completion beats expiry and expiry beats cancellation.
async fn race<C, X>(completion: C, deadline: Instant, cancelled: X) -> Outcome
where
    C: Future<Output = BufferedResponse>,
    X: Future<Output = ()>,
{
    tokio::select! {
        biased;

        buffered = completion => Outcome::Completed(buffered),
        () = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
        () = cancelled => Outcome::Cancelled,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// =============================================================================
// Tower Layer
// =============================================================================

#[derive(Serialize)]
struct TimeoutBody<'a> {
    error: &'a str,
    timeout: String,
}

/// Tower layer enforcing a deadline on everything beneath it.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/reports", get(build_report))
///     .layer(TimeoutLayer::new(Duration::from_secs(5)));
/// ```
#[derive(Clone, Debug)]
pub struct TimeoutLayer {
    config: Arc<TimeoutConfig>,
    executor: DeadlineExecutor,
}

impl TimeoutLayer {
    /// Gateway-style timeout with the given budget.
    pub fn new(timeout: Duration) -> Self {
        Self::with_config(TimeoutConfig::gateway().with_timeout(timeout))
    }

    pub fn from_secs(seconds: u64) -> Self {
        Self::new(Duration::from_secs(seconds))
    }

    pub fn from_mins(minutes: u64) -> Self {
        Self::new(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn with_config(config: TimeoutConfig) -> Self {
        let config = config.normalized();
        let executor = DeadlineExecutor::new(config.timeout);

        Self {
            config: Arc::new(config),
            executor,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Number of guarded tasks still running, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    /// Wait for all guarded tasks to finish. Call during graceful shutdown.
    pub async fn drain(&self) {
        self.executor.drain().await;
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            config: self.config.clone(),
            executor: self.executor.clone(),
        }
    }
}

/// Timeout service wrapper.
#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    config: Arc<TimeoutConfig>,
    executor: DeadlineExecutor,
}

impl<S> Service<Request<Body>> for TimeoutService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if self.config.should_skip(&req) {
            debug!(path = %req.uri().path(), "Timeout skipped for request");
            return Box::pin(self.inner.call(req));
        }

        // The service that was polled ready goes to the task; keep a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();
        let executor = self.executor.clone();

        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let cancel = req.extensions().get::<CancellationToken>().cloned();

        Box::pin(async move {
            let started = Instant::now();

            let continuation = async move {
                let response = inner
                    .call(req)
                    .await
                    .map_err(|e| DownstreamFault::Service(e.to_string()))?;
                Ok::<_, DownstreamFault>(BufferedResponse::collect(response).await?)
            };

            let outcome = executor.execute(continuation, cancel).await;
            metrics::record_guarded_duration(outcome.label(), started.elapsed().as_secs_f64());

            let response = match outcome {
                Outcome::Completed(buffered) => buffered.into_response(),
                Outcome::TimedOut => {
                    warn!(
                        method = %method,
                        path = %path,
                        timeout = %duration_string(config.timeout),
                        "Request exceeded its deadline"
                    );
                    metrics::record_timeout();
                    timeout_response(&config)
                }
                Outcome::Cancelled => {
                    debug!(method = %method, path = %path, "Guarded request cancelled");
                    metrics::record_cancelled();
                    config.status_code.into_response()
                }
            };

            Ok(response)
        })
    }
}

fn timeout_response(config: &TimeoutConfig) -> Response<Body> {
    let body = TimeoutBody {
        error: &config.error_message,
        timeout: duration_string(config.timeout),
    };
    (config.status_code, Json(body)).into_response()
}
