use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{ChunkSink, Flow, ProviderClient, StreamEnd};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::providers::is_openrouter;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::ollama_stream::OllamaStreamWriter;
use crate::translate::ollama_types::{OllamaChatRequest, OllamaChatResponse, OllamaError};
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionRequest, ProviderPreference, StreamOptions};
use crate::translate::request::{anthropic_to_openai, ollama_to_openai, resolve_model};
use crate::translate::response::{openai_to_anthropic, openai_to_ollama, upstream_error_to_anthropic};
use crate::translate::streaming::StreamTranslator;

const CHANNEL_CAPACITY: usize = 64;

/// One named SSE event, serialized and ready to send.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_stream_event(event: &StreamEvent) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(data) => Some(Self {
                event: event.event_name().to_string(),
                data,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize stream event");
                None
            }
        }
    }
}

pub type SseStream = ReceiverStream<SseEvent>;
pub type NdjsonStream = ReceiverStream<std::result::Result<Bytes, Infallible>>;

/// Map a proxy failure onto the Anthropic error body and HTTP status.
pub fn anthropic_error(err: &ProxyError) -> (u16, ErrorResponse) {
    match err {
        ProxyError::Upstream { status, body } => (err.status_code(), upstream_error_to_anthropic(*status, body)),
        _ => {
            let status = err.status_code();
            (status, ErrorResponse::for_status(status, err.to_string()))
        }
    }
}

/// Message for an Ollama `{"error": ...}` body.
pub fn ollama_error(err: &ProxyError) -> OllamaError {
    match err {
        ProxyError::Upstream { body, .. } if !body.trim().is_empty() => OllamaError::new(body.clone()),
        _ => OllamaError::new(err.to_string()),
    }
}

/// Attach the OpenRouter provider pin for the resolved model, if configured.
fn apply_provider_preference(
    request: &mut ChatCompletionRequest,
    config: &ProxyConfig,
    provider: &dyn ProviderClient,
) {
    if !is_openrouter(provider.base_url()) {
        return;
    }
    if let Some(preference) = config.provider_preference(&request.model) {
        tracing::debug!(model = %request.model, provider = preference, "Pinning OpenRouter provider");
        request.provider = Some(ProviderPreference::pinned(preference));
    }
}

fn set_streaming(request: &mut ChatCompletionRequest, stream: bool) {
    request.stream = Some(stream);
    request.stream_options = stream.then_some(StreamOptions {
        include_usage: true,
    });
}

/// Build the upstream request for an Anthropic Messages call.
pub fn upstream_request_for_messages(
    req: &MessagesRequest,
    config: &ProxyConfig,
    provider: &dyn ProviderClient,
    stream: bool,
) -> ChatCompletionRequest {
    let target = resolve_model(config, &req.model);
    let mut request = anthropic_to_openai(req, &target);
    set_streaming(&mut request, stream);
    apply_provider_preference(&mut request, config, provider);
    request
}

/// Build the upstream request for an Ollama chat call.
pub fn upstream_request_for_ollama(
    req: &OllamaChatRequest,
    config: &ProxyConfig,
    provider: &dyn ProviderClient,
) -> ChatCompletionRequest {
    let target = resolve_model(config, &req.model);
    let mut request = ollama_to_openai(req, &target);
    set_streaming(&mut request, req.wants_stream());
    apply_provider_preference(&mut request, config, provider);
    request
}

/// Forward a non-streaming Anthropic request through the configured backend.
pub async fn proxy_messages(
    req: &MessagesRequest,
    config: &ProxyConfig,
    provider: &dyn ProviderClient,
) -> Result<MessagesResponse> {
    let request = upstream_request_for_messages(req, config, provider, false);
    tracing::info!(model = %req.model, upstream_model = %request.model, "Forwarding messages request");

    let response = provider.chat(&request).await?;
    let anthropic = openai_to_anthropic(&response, &req.model)?;

    tracing::info!(
        input_tokens = anthropic.usage.input_tokens,
        output_tokens = anthropic.usage.output_tokens,
        stop_reason = anthropic.stop_reason.as_deref().unwrap_or_default(),
        "Completed"
    );
    Ok(anthropic)
}

/// Feeds upstream chunks through a [`StreamTranslator`] into the SSE channel.
struct AnthropicSink {
    translator: StreamTranslator,
    tx: mpsc::Sender<SseEvent>,
}

impl AnthropicSink {
    async fn send_all(&self, events: Vec<StreamEvent>) -> Flow {
        for event in events {
            let Some(sse) = SseEvent::from_stream_event(&event) else {
                continue;
            };
            if self.tx.send(sse).await.is_err() {
                return Flow::Stopped;
            }
        }
        Flow::Continue
    }
}

#[async_trait]
impl ChunkSink for AnthropicSink {
    async fn accept(&mut self, chunk: ChatCompletionChunk) -> Flow {
        let events = self.translator.process_chunk(&chunk);
        self.send_all(events).await
    }
}

/// Forward a streaming Anthropic request. The returned stream yields SSE
/// events as the upstream produces them; a spawned task owns the upstream
/// connection and drops it as soon as the receiver goes away.
pub fn proxy_messages_stream(
    req: &MessagesRequest,
    config: Arc<ProxyConfig>,
    provider: Arc<dyn ProviderClient>,
) -> SseStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let request = upstream_request_for_messages(req, &config, provider.as_ref(), true);
    let model = req.model.clone();

    tracing::info!(model = %model, upstream_model = %request.model, "Forwarding messages request (streaming)");

    tokio::spawn(async move {
        let fallback_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        let mut sink = AnthropicSink {
            translator: StreamTranslator::new(&model, &fallback_id),
            tx: tx.clone(),
        };

        let result = tokio::select! {
            result = provider.chat_stream(&request, &mut sink) => result,
            () = tx.closed() => Ok(StreamEnd::Disconnected),
        };

        match result {
            Ok(StreamEnd::Completed) => {
                let mut tail = sink.translator.finish();
                let leave_open = !config.stream.stop_after_tool_use && sink.translator.tool_use_detected();
                if leave_open {
                    tracing::debug!("Tool use detected, withholding message_stop");
                } else {
                    tail.extend(sink.translator.message_stop());
                }
                if sink.send_all(tail).await == Flow::Continue {
                    tracing::info!(model = %model, tool_use = sink.translator.tool_use_detected(), "Stream completed");
                }
            }
            Ok(StreamEnd::Disconnected) => {
                tracing::debug!(model = %model, "Client disconnected mid-stream");
            }
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Stream failed");
                let (_, body) = anthropic_error(&e);
                let event = StreamEvent::Error { error: body.error };
                let _ = sink.send_all(vec![event]).await;
            }
        }
    });

    ReceiverStream::new(rx)
}

fn created_at() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Forward a non-streaming Ollama chat request.
pub async fn proxy_ollama_chat(
    req: &OllamaChatRequest,
    config: &ProxyConfig,
    provider: &dyn ProviderClient,
) -> Result<OllamaChatResponse> {
    let request = upstream_request_for_ollama(req, config, provider);
    tracing::info!(model = %req.model, upstream_model = %request.model, "Forwarding Ollama chat request");

    let response = provider.chat(&request).await?;
    openai_to_ollama(&response, &req.model, &created_at())
}

fn ndjson_line<T: serde::Serialize>(value: &T) -> Option<Bytes> {
    match serde_json::to_vec(value) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize NDJSON line");
            None
        }
    }
}

/// Feeds upstream chunks through an [`OllamaStreamWriter`] into the NDJSON channel.
struct OllamaSink {
    writer: OllamaStreamWriter,
    tx: mpsc::Sender<std::result::Result<Bytes, Infallible>>,
}

impl OllamaSink {
    async fn send_all(&self, lines: Vec<OllamaChatResponse>) -> Flow {
        for line in lines {
            let Some(bytes) = ndjson_line(&line) else {
                continue;
            };
            if self.tx.send(Ok(bytes)).await.is_err() {
                return Flow::Stopped;
            }
        }
        Flow::Continue
    }
}

#[async_trait]
impl ChunkSink for OllamaSink {
    async fn accept(&mut self, chunk: ChatCompletionChunk) -> Flow {
        let lines = self.writer.process_chunk(&chunk);
        self.send_all(lines).await
    }
}

/// Forward a streaming Ollama chat request as NDJSON lines.
pub fn proxy_ollama_chat_stream(
    req: &OllamaChatRequest,
    config: &ProxyConfig,
    provider: Arc<dyn ProviderClient>,
) -> NdjsonStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let request = upstream_request_for_ollama(req, config, provider.as_ref());
    let model = req.model.clone();

    tracing::info!(model = %model, upstream_model = %request.model, "Forwarding Ollama chat request (streaming)");

    tokio::spawn(async move {
        let mut sink = OllamaSink {
            writer: OllamaStreamWriter::new(&model, &created_at()),
            tx: tx.clone(),
        };

        let result = tokio::select! {
            result = provider.chat_stream(&request, &mut sink) => result,
            () = tx.closed() => Ok(StreamEnd::Disconnected),
        };

        match result {
            Ok(StreamEnd::Completed) => {
                let tail = sink.writer.finish();
                if sink.send_all(tail).await == Flow::Continue {
                    tracing::info!(model = %model, "Stream completed");
                }
            }
            Ok(StreamEnd::Disconnected) => {
                tracing::debug!(model = %model, "Client disconnected mid-stream");
            }
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Stream failed");
                if let Some(line) = ndjson_line(&ollama_error(&e)) {
                    let _ = sink.tx.send(Ok(line)).await;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}
