//! Request forwarding to the llama.cpp server.
//!
//! Each request is relayed either buffered (the whole upstream response
//! is read, then returned) or streamed (upstream chunks are written to the
//! client as they arrive), depending on [`is_streaming_request`].

use std::sync::Arc;

use axum::body::{boxed, Full, StreamBody};
use axum::extract::State;
use axum::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;

use crate::detect::is_streaming_request;
use crate::error::ProxyError;
use crate::state::AppState;

/// Request headers never sent upstream.
///
/// `accept-encoding` is dropped because upstream bodies are relayed as-is
/// and the client is built without decompression.
const DROPPED_REQUEST_HEADERS: [&str; 4] =
    ["host", "connection", "transfer-encoding", "accept-encoding"];

/// Upstream response headers never relayed back.
const DROPPED_RESPONSE_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

const FORWARDED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
];

/// Catch-all handler for `/` and `/*path`.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !FORWARDED_METHODS.contains(&method) {
        return ProxyError::MethodNotAllowed(method.to_string()).into_response();
    }

    let target = state.target_url(uri.path(), uri.query());
    tracing::info!(method = %method, url = %uri, target = %target, "Proxying");

    let upstream_headers = filter_headers(&headers, &DROPPED_REQUEST_HEADERS);
    let result = if is_streaming_request(&headers, uri.query(), &body) {
        tracing::info!(method = %method, url = %uri, "Detected streaming request");
        forward_streaming(&state, method.clone(), &target, upstream_headers, body).await
    } else {
        forward_buffered(&state, method.clone(), &target, upstream_headers, body).await
    };

    match result {
        Ok(response) => {
            tracing::info!(
                method = %method,
                url = %uri,
                status = response.status().as_u16(),
                "Response"
            );
            response
        }
        Err(e) => {
            tracing::error!(
                method = %method,
                url = %uri,
                target = %target,
                error = %e,
                "{}",
                e.label()
            );
            e.into_response()
        }
    }
}

async fn forward_buffered(
    state: &AppState,
    method: Method,
    target: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let upstream = &state.config.upstream;
    let resp = upstream_request(&state.buffered, method, target, headers, body)
        .send()
        .await
        .map_err(|e| ProxyError::from_buffered(e, upstream))?;

    let status = resp.status();
    let headers = filter_headers(resp.headers(), &DROPPED_RESPONSE_HEADERS);
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ProxyError::from_buffered(e, upstream))?;

    Ok(build_response(status, headers, boxed(Full::from(bytes))))
}

async fn forward_streaming(
    state: &AppState,
    method: Method,
    target: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let resp = upstream_request(&state.streaming, method, target, headers, body)
        .send()
        .await
        .map_err(|e| ProxyError::StreamingSetup(e.to_string()))?;

    let status = resp.status();
    let mut headers = filter_headers(resp.headers(), &DROPPED_RESPONSE_HEADERS);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    }

    // Headers are already sent once the body starts; a mid-stream failure
    // can only end the response early.
    let stream = resp
        .bytes_stream()
        .inspect_err(|e| tracing::error!(error = %e, "Streaming proxy error"));

    Ok(build_response(status, headers, boxed(StreamBody::new(stream))))
}

fn upstream_request(
    client: &reqwest::Client,
    method: Method,
    target: &str,
    headers: HeaderMap,
    body: Bytes,
) -> reqwest::RequestBuilder {
    let request = client.request(method, target).headers(headers);
    if body.is_empty() {
        request
    } else {
        request.body(body)
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: axum::body::BoxBody) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Copy `headers`, leaving out the names in `dropped` (lowercase).
fn filter_headers(headers: &HeaderMap, dropped: &[&str]) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !dropped.contains(&name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_filtering() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("relay:8080"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let filtered = filter_headers(&headers, &DROPPED_REQUEST_HEADERS);
        assert!(filtered.get("host").is_none());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("accept-encoding").is_none());
        assert_eq!(filtered.get("authorization").unwrap(), "Bearer t");
        assert_eq!(filtered.get_all("x-tag").iter().count(), 2);
    }

    #[test]
    fn test_response_header_filtering() {
        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("server", HeaderValue::from_static("llama.cpp"));

        let filtered = filter_headers(&headers, &DROPPED_RESPONSE_HEADERS);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
        assert_eq!(filtered.get("server").unwrap(), "llama.cpp");
    }

    #[test]
    fn test_forwarded_methods() {
        assert!(FORWARDED_METHODS.contains(&Method::PATCH));
        assert!(!FORWARDED_METHODS.contains(&Method::HEAD));
        assert!(!FORWARDED_METHODS.contains(&Method::OPTIONS));
    }
}
