//! Streaming request detection.

use http::header::{ACCEPT, CONTENT_TYPE};
use http::HeaderMap;

const STREAM_ACCEPT_TYPES: [&str; 2] = ["text/event-stream", "application/x-ndjson"];
const STREAM_QUERY_VALUES: [&str; 3] = ["true", "1", "yes"];

/// True when the client asked for an incremental response.
///
/// Any one of these counts:
/// - `Accept` mentions `text/event-stream` or `application/x-ndjson`
/// - the `stream` query parameter is `true`, `1` or `yes` (any case)
/// - a JSON body is an object with `"stream": true`
pub fn is_streaming_request(headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> bool {
    accept_wants_stream(headers) || query_wants_stream(query) || body_wants_stream(headers, body)
}

fn accept_wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|accept| STREAM_ACCEPT_TYPES.iter().any(|t| accept.contains(t)))
}

fn query_wants_stream(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return false;
    };
    // First occurrence wins
    let value = query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == "stream").then_some(value)
        })
        .next();
    match value {
        Some(value) => {
            let value = value.to_ascii_lowercase();
            STREAM_QUERY_VALUES.contains(&value.as_str())
        }
        None => false,
    }
}

fn body_wants_stream(headers: &HeaderMap, body: &[u8]) -> bool {
    if !is_json(headers) || body.is_empty() {
        return false;
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => map.get("stream") == Some(&serde_json::Value::Bool(true)),
        _ => false,
    }
}

/// `application/json` or any `application/*+json` media type.
fn is_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}
