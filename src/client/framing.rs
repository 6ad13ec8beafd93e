//! Splitting upstream response bodies into frames.
//!
//! OpenAI-compatible and OpenWebUI backends stream Server-Sent Events whose
//! `data` carries one JSON chunk, terminated by `[DONE]`. Ollama streams
//! newline-delimited JSON. Both are reduced to a stream of [`Frame`]s.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// One JSON payload, not yet parsed.
    Data(String),
    /// Explicit end-of-stream marker.
    Done,
}

/// Frame an SSE body.
pub fn sse_frames<S, E>(bytes: S) -> BoxStream<'static, Result<Frame>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    bytes
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        None
                    } else if data == "[DONE]" {
                        Some(Ok(Frame::Done))
                    } else {
                        Some(Ok(Frame::Data(data.to_owned())))
                    }
                }
                Err(e) => Some(Err(ProxyError::transport(format!("SSE stream error: {e}")))),
            }
        })
        .boxed()
}

/// Frame an NDJSON body: one frame per non-empty line. A final line without
/// a trailing newline still counts.
pub fn ndjson_frames<S, E>(bytes: S) -> BoxStream<'static, Result<Frame>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes = Box::pin(bytes);

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(ProxyError::transport(format!("NDJSON stream error: {e}")));
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if !line.is_empty() {
                    yield Ok(Frame::Data(line));
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
        if !rest.is_empty() {
            yield Ok(Frame::Data(rest));
        }
    }
    .boxed()
}

/// Parse a frame payload as JSON.
///
/// Returns `None` for payloads that aren't JSON (keep-alives, comments), which
/// callers skip. A payload that is an error object becomes an upstream error.
pub fn parse_payload(data: &str) -> Option<Result<Value>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, data = %data, "Skipping unparseable stream frame");
            return None;
        }
    };

    match value.get("error") {
        Some(err) if !err.is_null() => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| err.as_str())
                .map_or_else(|| err.to_string(), str::to_string);
            Some(Err(ProxyError::upstream(502, message)))
        }
        _ => Some(Ok(value)),
    }
}
