//! relaybox relay - streaming HTTP reverse proxy in front of a llama.cpp server.
//!
//! `GET /health` is answered locally; every other method and path is
//! forwarded to the configured upstream, buffered or streamed depending on
//! the request.

pub mod detect;
pub mod error;
pub mod forward;
pub mod state;

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{any, get};
use axum::{Json, Router};
use relaybox_core::config::ProxyConfig;
use relaybox_core::error::{RelayError, Result};

pub use detect::is_streaming_request;
pub use error::ProxyError;
pub use state::AppState;

/// Build the relay router over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/health", get(health).fallback(forward::proxy))
        .route("/", any(forward::proxy))
        .route("/*path", any(forward::proxy))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "target": state.config.upstream,
        "timestamp": chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    }))
}

/// Bind `config.bind_addr()` and serve until Ctrl-C.
pub async fn serve(config: ProxyConfig) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr()).map_err(|e| {
        RelayError::ConfigError(format!("Failed to bind {}: {}", config.bind_addr(), e))
    })?;
    let state = AppState::new(config)?;
    serve_listener(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    tracing::info!(
        addr = %addr,
        upstream = %state.config.upstream,
        "Relay listening"
    );

    let app = build_router(state);
    axum::Server::from_tcp(listener)
        .map_err(|e| RelayError::Other(format!("Failed to start relay on {}: {}", addr, e)))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RelayError::Other(format!("Relay server error: {}", e)))?;

    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let config = ProxyConfig {
            upstream: "http://127.0.0.1:9".to_string(),
            ..ProxyConfig::default()
        };
        build_router(AppState::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["target"], "http://127.0.0.1:9");
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").is_ok());
    }

    #[tokio::test]
    async fn test_non_get_health_goes_upstream() {
        let response = router()
            .oneshot(
                Request::post("/health")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        // Forwarded to the unreachable upstream, not rejected locally
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unlisted_method_rejected() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
