//! Liveness responder for hosting platforms.
//!
//! Carries no application data. Runs next to the bot until the shared
//! shutdown token is cancelled.

use crate::config::GatewayConfig;
use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

pub const ALIVE_BODY: &str = "Bot is alive and healthy!";

/// Build the health router with a per-request timeout.
pub fn router(request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Bind `config.host:config.port` and serve until `shutdown` fires.
pub async fn run_gateway(config: &GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid gateway address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {addr}"))?;

    serve(
        listener,
        Duration::from_secs(config.request_timeout_secs.max(1)),
        shutdown,
    )
    .await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!("Health endpoint listening on http://{local}");

    axum::serve(listener, router(request_timeout))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::debug!("Health endpoint stopped");
    Ok(())
}

/// GET /: plain-text liveness check
async fn handle_root() -> &'static str {
    ALIVE_BODY
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_test_server() -> (String, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, Duration::from_secs(5), shutdown.clone()));
        (base, shutdown, handle)
    }

    #[tokio::test]
    async fn root_reports_alive() {
        let (base, shutdown, handle) = spawn_test_server().await;

        let response = reqwest::get(&base).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), ALIVE_BODY);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let (base, shutdown, handle) = spawn_test_server().await;

        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({ "status": "ok" }));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (base, shutdown, handle) = spawn_test_server().await;

        let response = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_host_is_rejected() {
        let config = GatewayConfig {
            host: "not a host".into(),
            ..GatewayConfig::default()
        };
        let err = run_gateway(&config, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid gateway address"));
    }
}
