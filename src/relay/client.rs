//! HTTP client utilities
//!
//! Shared plumbing for upstream calls: client construction with the relay
//! timeouts, retry-delay policy, and the SSE line helpers the stream
//! rewriters build on.

use std::time::{Duration, Instant};

use rand::{rngs::OsRng, RngCore};
use reqwest::{header::HeaderMap, Client, Response};
use serde_json::Value;

use crate::config;

use super::error::{RelayError, RelayResult};

/// Create a new HTTP client with standard configuration.
pub fn create_client(timeout_secs: u64) -> RelayResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Client for buffered requests; bounded by the relay timeout.
pub fn default_client() -> RelayResult<Client> {
    create_client(config::load().relay_timeout_secs)
}

/// Client for streaming requests. The overall bound still applies; the idle
/// bound between frames is enforced by the stream loop.
pub fn streaming_client() -> RelayResult<Client> {
    create_client(config::load().relay_timeout_secs)
}

/// Whether an upstream status justifies trying another channel.
pub fn should_retry(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504 | 429)
}

/// Exponential backoff with jitter between channel attempts.
pub fn calculate_retry_delay(attempt: u32) -> Duration {
    let cfg = config::load();
    let base_delay = cfg.retry_initial_ms;
    let max_delay = cfg.retry_max_ms;

    let exp_delay = (1u64 << attempt.min(10)) * base_delay;
    let delay = exp_delay.min(max_delay);

    let mut jitter_bytes = [0u8; 8];
    OsRng.fill_bytes(&mut jitter_bytes);
    let jitter = u64::from_le_bytes(jitter_bytes) % (delay / 4 + 1);

    Duration::from_millis(delay + jitter)
}

pub struct RequestAttempt {
    pub response: Response,
    pub latency_ms: u64,
}

/// One POST attempt against an upstream URL.
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> RelayResult<RequestAttempt> {
    let start = Instant::now();

    crate::logger::debug("client", &format!("Sending request to: {}", url));

    let response = client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            crate::logger::error("client", &format!("Request failed: {}", e));
            if e.is_timeout() {
                RelayError::UpstreamTimeout("Request timeout".to_string())
            } else if e.is_connect() {
                RelayError::UpstreamError(format!("Connection failed: {}", e))
            } else {
                RelayError::UpstreamError(format!("Request error: {}", e))
            }
        })?;

    let latency_ms = start.elapsed().as_millis() as u64;
    crate::logger::debug(
        "client",
        &format!("Response status: {} ({}ms)", response.status(), latency_ms),
    );

    Ok(RequestAttempt {
        response,
        latency_ms,
    })
}

/// Raw-body POST for opaque relays (audio multipart, image edits).
pub async fn post_bytes(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    content_type: &str,
    body: Vec<u8>,
) -> RelayResult<RequestAttempt> {
    let start = Instant::now();
    let response = client
        .post(url)
        .headers(headers)
        .header("content-type", content_type)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RelayError::UpstreamTimeout("Request timeout".to_string())
            } else {
                RelayError::UpstreamError(format!("Request error: {}", e))
            }
        })?;
    Ok(RequestAttempt {
        response,
        latency_ms: start.elapsed().as_millis() as u64,
    })
}

/// Parse an SSE `data:` line, returning the payload.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.strip_prefix(' ').unwrap_or(rest));
    }
    None
}

/// Check whether an SSE payload is the `[DONE]` sentinel.
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Normalize the `stream` flag to a boolean if present; returns it.
pub fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };

    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };

    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }

    is_streaming
}

/// Parse JSON response text with a fallback for SSE-shaped bodies.
pub fn parse_json_response(response_text: &str) -> Result<Value, serde_json::Error> {
    let trimmed = response_text.trim();
    let parse_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if response_text.contains("data:") {
        let mut last_value = None;
        for line in response_text.lines() {
            if let Some(data) = parse_sse_data(line) {
                let data = data.trim();
                if data.is_empty() || is_sse_done(data) {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    last_value = Some(value);
                }
            }
        }
        if let Some(value) = last_value {
            return Ok(value);
        }
    }

    Err(parse_err)
}

/// Drain complete SSE lines from a byte buffer.
///
/// Handles chunked responses where line breaks split across reads.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };

        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        assert!(should_retry(500));
        assert!(should_retry(502));
        assert!(should_retry(503));
        assert!(should_retry(504));
        assert!(should_retry(429));

        assert!(!should_retry(400));
        assert!(!should_retry(401));
        assert!(!should_retry(403));
        assert!(!should_retry(404));
        assert!(!should_retry(200));
    }

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert_eq!(parse_sse_data("hello"), None);
    }

    #[test]
    fn test_is_sse_done() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
        assert!(!is_sse_done("data"));
    }

    #[test]
    fn test_drain_sse_lines_partial() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());

        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_sse_lines_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\n");
        assert_eq!(lines, vec!["data: ok"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_normalize_stream_flag() {
        let mut payload = serde_json::json!({"stream": "true"});
        assert!(normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], serde_json::json!(true));

        let mut payload = serde_json::json!({"stream": 0});
        assert!(!normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], serde_json::json!(false));

        let mut payload = serde_json::json!({});
        assert!(!normalize_stream_flag(&mut payload));
    }

    #[test]
    fn test_parse_json_response_sse_fallback() {
        let body = "data: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: [DONE]\n\n";
        let value = parse_json_response(body).unwrap();
        assert_eq!(value["a"], 2);
    }
}
