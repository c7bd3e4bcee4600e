//! Shared helpers for the provider adapters: failure classification,
//! sampling-parameter translation, and SSE stream plumbing.

use futures_util::stream;

use crate::ensemble::client_wrapper::{MessageChunk, MessageChunkStream};
use crate::ensemble::error::LlmError;

/// Maximum number of upstream error-body bytes carried into an [`LlmError`].
const ERROR_BODY_CAP: usize = 500;

/// Classify an HTTP error response into an [`LlmError`].
///
/// Providers occasionally front their APIs with proxies that answer auth
/// failures with an HTML error page instead of JSON; a 4xx with a markup
/// body is treated as an authentication failure.
pub fn classify_status(provider: &str, status: u16, body: &str) -> LlmError {
    if status == 401 || status == 403 {
        return LlmError::Authentication {
            provider: provider.to_string(),
        };
    }
    if (400..500).contains(&status) && looks_like_html(body) {
        return LlmError::Authentication {
            provider: provider.to_string(),
        };
    }
    if status == 400 && mentions_context_window(body) {
        // The adapter has no token counts at this point; the service's own
        // pre-flight estimate catches the common case before the wire.
        return LlmError::Validation(format!(
            "{}: request exceeds the model context window",
            provider
        ));
    }
    if status == 404 {
        return LlmError::Validation(format!("{}: endpoint or model not found", provider));
    }
    LlmError::Provider {
        provider: provider.to_string(),
        status: Some(status),
        message: truncate_body(body),
    }
}

/// Wrap a transport-level failure (connect, reset, body read) as a
/// retryable provider error with no status.
pub fn transport_error(provider: &str, err: &reqwest::Error) -> LlmError {
    LlmError::Provider {
        provider: provider.to_string(),
        status: None,
        message: err.to_string(),
    }
}

/// Translate a normalized repetition/presence penalty into the wire scale.
///
/// The normalized convention uses `1.0` for "no penalty"; providers use `0`.
pub fn penalty_to_wire(penalty: f64) -> f64 {
    if penalty == 1.0 {
        0.0
    } else {
        penalty - 1.0
    }
}

fn looks_like_html(body: &str) -> bool {
    let trimmed = body.trim_start();
    trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") || trimmed.starts_with("<HTML")
}

fn mentions_context_window(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context length") || lower.contains("context window") || lower.contains("maximum context")
}

fn truncate_body(body: &str) -> String {
    if body.len() > ERROR_BODY_CAP {
        let mut cut = ERROR_BODY_CAP;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    } else {
        body.to_string()
    }
}

/// Extract the payloads of `data:` lines from one SSE buffer segment,
/// stopping at the `[DONE]` sentinel.
pub fn sse_data_lines(segment: &str) -> Vec<String> {
    segment
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .take_while(|payload| *payload != "[DONE]")
        .map(str::to_string)
        .collect()
}

/// Convert a fully collected chunk vector into the stream type the
/// [`ProviderClient`](crate::ensemble::client_wrapper::ProviderClient)
/// contract expects.
pub fn chunks_to_stream(chunks: Vec<Result<MessageChunk, LlmError>>) -> MessageChunkStream {
    Box::pin(stream::iter(chunks))
}

/// Drain an SSE response body into chunk results, decoding each `data:`
/// payload with `parse_delta` (`None` skips keep-alive events).
///
/// The body is read to completion here; callers replay the collected
/// chunks through [`chunks_to_stream`]. Dropping the future mid-read
/// abandons the connection.
pub async fn collect_sse_chunks<F>(
    provider: &str,
    mut response: reqwest::Response,
    parse_delta: F,
) -> Vec<Result<MessageChunk, LlmError>>
where
    F: Fn(&str) -> Option<MessageChunk>,
{
    let mut chunks = Vec::new();
    let mut pending = String::new();
    loop {
        match response.chunk().await {
            Ok(Some(buf)) => {
                pending.push_str(&String::from_utf8_lossy(&buf));
                // Only consume complete events; partial lines stay pending.
                if let Some(idx) = pending.rfind('\n') {
                    let complete: String = pending.drain(..=idx).collect();
                    for payload in sse_data_lines(&complete) {
                        if let Some(chunk) = parse_delta(&payload) {
                            chunks.push(Ok(chunk));
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                chunks.push(Err(transport_error(provider, &err)));
                break;
            }
        }
    }
    chunks
}
