//! # Request Guard
//!
//! Axum middleware that protects downstream handlers:
//!
//! - **Deadline-bounded execution**: the rest of the chain runs on its own
//!   task under a time budget. The caller receives exactly one response,
//!   either the handler's (buffered in full) or a JSON timeout payload.
//!   Late handlers finish in the background and their output is discarded.
//! - **Concurrent rate limiting**: per-key fixed windows with lazy reset,
//!   a two-level lock so unrelated keys never serialize, and a background
//!   sweep that evicts idle keys.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TraceLayer → RateLimitLayer → TimeoutLayer                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TokenBucketLimiter          DeadlineExecutor + TaskTracker │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, ready, work)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use axum::{Router, routing::get};
//! use request_guard::middleware::{RateLimitLayer, TimeoutLayer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app: Router = Router::new()
//!         .route("/", get(|| async { "hello" }))
//!         .layer(TimeoutLayer::new(Duration::from_secs(5)))
//!         .layer(RateLimitLayer::per_minute(60));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Configuration
//!
//! The bundled server reads its settings from the environment:
//! ```bash
//! REQUEST_TIMEOUT_MS=5000 RATE_LIMIT_MAX=60 RATE_LIMIT_WINDOW_SECS=60 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{GuardError, GuardResult};
pub use routes::build_router;
pub use state::AppState;
