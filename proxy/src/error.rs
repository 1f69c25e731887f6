//! Relay error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failures answered by the relay itself rather than the upstream.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Upstream refused or could not be reached
    #[error("Unable to connect to llama.cpp server at {upstream}")]
    Connection { upstream: String },

    /// Buffered request exceeded the request timeout
    #[error("Request to llama.cpp server timed out")]
    Timeout,

    /// Streaming request failed before the upstream answered
    #[error("{0}")]
    StreamingSetup(String),

    /// Any other forwarding failure
    #[error("{0}")]
    Upstream(String),

    #[error("Method {0} is not allowed")]
    MethodNotAllowed(String),
}

impl ProxyError {
    /// Classify a buffered-request failure.
    pub fn from_buffered(err: reqwest::Error, upstream: &str) -> Self {
        if err.is_connect() {
            ProxyError::Connection {
                upstream: upstream.to_string(),
            }
        } else if err.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Upstream(err.to_string())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Connection { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::StreamingSetup(_) | ProxyError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Short label carried in the `error` field.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::Connection { .. } => "Connection error",
            ProxyError::Timeout => "Timeout error",
            ProxyError::StreamingSetup(_) => "Streaming setup error",
            ProxyError::Upstream(_) => "Proxy error",
            ProxyError::MethodNotAllowed(_) => "Method not allowed",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.label(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
