//! A scriptable upstream backend served by axum on an ephemeral port.
//!
//! The same handlers answer every dialect's chat and model-listing paths, so
//! one mock stands in for OpenAI-compatible, OpenWebUI and Ollama backends.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the mock answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(u16, Value),
    /// SSE body: one `data:` frame per entry, then `[DONE]`.
    Sse(Vec<Value>),
    /// SSE body with raw `data:` payloads, no `[DONE]` appended.
    RawSse(Vec<String>),
    /// NDJSON body, one line per entry.
    Ndjson(Vec<Value>),
    /// SSE body that sends these frames, then a text delta every 20ms
    /// until the reader goes away.
    Endless(Vec<Value>),
}

impl Reply {
    fn into_response(self, stream_closed: &CancellationToken) -> Response {
        match self {
            Reply::Json(status, body) => (
                StatusCode::from_u16(status).unwrap(),
                [(header::CONTENT_TYPE, "application/json")],
                body.to_string(),
            )
                .into_response(),
            Reply::Sse(chunks) => {
                let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
                body.push_str("data: [DONE]\n\n");
                sse(body)
            }
            Reply::RawSse(frames) => sse(frames.iter().map(|f| format!("data: {f}\n\n")).collect()),
            Reply::Ndjson(lines) => {
                let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
                Response::builder()
                    .header(header::CONTENT_TYPE, "application/x-ndjson")
                    .body(Body::from(body))
                    .unwrap()
            }
            Reply::Endless(chunks) => endless_sse(chunks, stream_closed.clone()),
        }
    }
}

/// Cancels its token when the response body holding it is dropped.
struct DropSignal(CancellationToken);

impl Drop for DropSignal {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn endless_sse(chunks: Vec<Value>, stream_closed: CancellationToken) -> Response {
    let filler = super::chunk(serde_json::json!({"content": "."}), None);
    let state = (chunks.into_iter(), DropSignal(stream_closed));
    let frames = futures::stream::unfold(state, move |(mut chunks, signal)| {
        let filler = filler.clone();
        async move {
            let frame = match chunks.next() {
                Some(chunk) => chunk,
                None => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    filler
                }
            };
            let bytes = Bytes::from(format!("data: {frame}\n\n"));
            Some((Ok::<_, Infallible>(bytes), (chunks, signal)))
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(frames))
        .unwrap()
}

fn sse(body: String) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

#[derive(Debug)]
struct Script {
    chat: Reply,
    models: Reply,
    chat_requests: Vec<Value>,
    model_requests: usize,
    stream_closed: CancellationToken,
}

pub struct MockUpstream {
    pub url: String,
    script: Arc<Mutex<Script>>,
    shutdown: CancellationToken,
}

impl MockUpstream {
    pub async fn start(chat: Reply) -> Self {
        Self::start_with_models(
            chat,
            Reply::Json(200, serde_json::json!({"object": "list", "data": []})),
        )
        .await
    }

    pub async fn start_with_models(chat: Reply, models: Reply) -> Self {
        let script = Arc::new(Mutex::new(Script {
            chat,
            models,
            chat_requests: Vec::new(),
            model_requests: 0,
            stream_closed: CancellationToken::new(),
        }));

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat))
            .route("/api/chat/completions", post(handle_chat))
            .route("/api/chat", post(handle_chat))
            .route("/v1/models", get(handle_models))
            .route("/api/models", get(handle_models))
            .route("/api/tags", get(handle_models))
            .with_state(script.clone());

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

        Self {
            url: format!("http://{addr}"),
            script,
            shutdown,
        }
    }

    /// Bodies of every chat request received, in order.
    pub fn chat_requests(&self) -> Vec<Value> {
        self.script.lock().unwrap().chat_requests.clone()
    }

    pub fn model_requests(&self) -> usize {
        self.script.lock().unwrap().model_requests
    }

    /// Cancelled once an [`Reply::Endless`] body has been dropped, i.e. the
    /// proxy closed its upstream connection.
    pub fn stream_closed(&self) -> CancellationToken {
        self.script.lock().unwrap().stream_closed.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_chat(State(script): State<Arc<Mutex<Script>>>, body: Bytes) -> Response {
    let (reply, stream_closed) = {
        let mut script = script.lock().unwrap();
        script
            .chat_requests
            .push(serde_json::from_slice(&body).unwrap_or(Value::Null));
        (script.chat.clone(), script.stream_closed.clone())
    };
    reply.into_response(&stream_closed)
}

async fn handle_models(State(script): State<Arc<Mutex<Script>>>) -> Response {
    let (reply, stream_closed) = {
        let mut script = script.lock().unwrap();
        script.model_requests += 1;
        (script.models.clone(), script.stream_closed.clone())
    };
    reply.into_response(&stream_closed)
}
