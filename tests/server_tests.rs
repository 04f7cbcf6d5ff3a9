//! End-to-end tests against a real listener.
//!
//! The application is served on an ephemeral port with connect info, the way
//! `main` serves it, and exercised over HTTP with reqwest.
//!
//! Run with: `cargo test --test server_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use request_guard::{AppState, Config, build_router};

struct TestServer {
    base_url: String,
    state: AppState,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = AppState::new(config);
        let app = build_router(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stop(self) {
        self.handle.abort();
        self.state.shutdown().await;
    }
}

#[tokio::test]
async fn health_reports_guard_state() {
    let server = TestServer::start(Config::default()).await;
    let client = Client::new();

    let response = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["guarded_in_flight"].is_u64());

    server.stop().await;
}

#[tokio::test]
async fn slow_request_times_out_over_http() {
    let config = Config {
        request_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let server = TestServer::start(config).await;
    let client = Client::new();

    let response = client
        .get(server.url("/work?delay_ms=1000"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Request timeout");
    assert_eq!(body["timeout"], "100ms");

    server.stop().await;
}

#[tokio::test]
async fn rate_limit_keys_on_peer_ip_across_connections() {
    let config = Config {
        rate_limit_max: 2,
        rate_limit_window: Duration::from_secs(60),
        ..Config::default()
    };
    let server = TestServer::start(config).await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        // A fresh client per request opens a new connection (new source port)
        let response = Client::new()
            .get(server.url("/work"))
            .header("x-forwarded-for", "198.51.100.77")
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
    assert!(
        server
            .state
            .rate_limit
            .as_ref()
            .unwrap()
            .limiter()
            .contains("127.0.0.1")
    );

    server.stop().await;
}
