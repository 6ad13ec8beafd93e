#![allow(dead_code)]

pub mod mock_upstream;

pub use mock_upstream::{MockUpstream, Reply};

use dialect_proxy::providers::Dialect;
use dialect_proxy::{build_router, AppState, HttpProvider, ProxyConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A running proxy in front of a mock backend.
pub struct Proxy {
    pub url: String,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn config_for(dialect: Dialect, base_url: &str) -> ProxyConfig {
    let mut config = ProxyConfig::for_backend("custom");
    config.backend.kind = Some(dialect);
    config.backend.base_url = Some(base_url.to_string());
    config.backend.api_key = Some("sk-test".to_string());
    config.model_cache.initial_backoff_ms = 1;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> Proxy {
    let client = reqwest::Client::new();
    let provider = HttpProvider::from_config(client.clone(), &config).unwrap();
    let state = Arc::new(AppState::new(config, Arc::new(provider)));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .unwrap();
    });

    Proxy {
        url: format!("http://{addr}"),
        client,
        shutdown,
    }
}

/// Split an SSE body into `(event, data)` pairs.
pub fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim());
                }
            }
            Some((event?, serde_json::from_str(&data).ok()?))
        })
        .collect()
}

pub fn parse_ndjson(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

pub fn event_names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}

// ── upstream payload builders ───────────────────────────────────

pub fn completion(content: &str, finish_reason: &str) -> Value {
    json!({
        "id": "chatcmpl-abc123",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "upstream-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
    })
}

pub fn chunk(delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-stream1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "upstream-model",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
}

pub fn text_stream(parts: &[&str]) -> Vec<Value> {
    let mut chunks = vec![chunk(json!({"role": "assistant"}), None)];
    chunks.extend(parts.iter().map(|p| chunk(json!({"content": p}), None)));
    chunks.push(chunk(json!({}), Some("stop")));
    chunks
}

pub fn tool_call_stream() -> Vec<Value> {
    vec![
        chunk(json!({"role": "assistant"}), None),
        chunk(
            json!({"tool_calls": [{"index": 0, "id": "call_abc", "type": "function",
                "function": {"name": "get_weather", "arguments": ""}}]}),
            None,
        ),
        chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"city\":"}}]}),
            None,
        ),
        chunk(
            json!({"tool_calls": [{"index": 0, "function": {"arguments": "\"London\"}"}}]}),
            None,
        ),
        chunk(json!({}), Some("tool_calls")),
    ]
}

pub fn user_message(model: &str, text: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "max_tokens": 100,
        "messages": [{"role": "user", "content": text}],
        "stream": stream
    })
}
