use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use super::framing::{ndjson_frames, parse_payload, sse_frames, Frame};
use super::{ChunkSink, DiscoveredModel, Flow, ProviderClient, StreamEnd};
use crate::config::{ProxyConfig, TimeoutsConfig};
use crate::error::{ProxyError, Result};
use crate::providers::{is_openrouter, Dialect};
use crate::translate::ollama_stream::OllamaChunkAdapter;
use crate::translate::ollama_types::{OllamaChatResponse, OllamaTagList};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, UpstreamModelList,
};
use crate::translate::request::openai_to_ollama;
use crate::translate::response::ollama_to_openai_response;
use crate::translate::tool_dialect::normalize_tool_calls;

const REFERER: &str = "https://github.com/dialect-proxy/dialect-proxy";
const TITLE: &str = "dialect-proxy";

/// HTTP client for one backend. The [`Dialect`] picks endpoint paths, body
/// framing and tool-call normalization.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    dialect: Dialect,
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl HttpProvider {
    pub fn new(
        client: reqwest::Client,
        dialect: Dialect,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeouts: &TimeoutsConfig,
    ) -> Self {
        Self {
            client,
            dialect,
            base_url: base_url.into(),
            api_key,
            request_timeout: timeouts.request(),
            stream_idle_timeout: timeouts.stream_idle(),
        }
    }

    pub fn from_config(client: reqwest::Client, config: &ProxyConfig) -> Result<Self> {
        Ok(Self::new(
            client,
            config.dialect()?,
            config.effective_base_url()?,
            config.resolve_api_key(),
            &config.timeouts,
        ))
    }

    /// Root the dialect's paths hang off.
    fn api_root(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.dialect {
            Dialect::OpenAi => {
                if base.ends_with("/v1") {
                    base.to_string()
                } else if is_openrouter(base) {
                    match base.strip_suffix("/api") {
                        Some(root) => format!("{root}/api/v1"),
                        None => format!("{base}/api/v1"),
                    }
                } else {
                    format!("{base}/v1")
                }
            }
            Dialect::OpenWebUi | Dialect::Ollama => {
                let root = base
                    .strip_suffix("/api/v1")
                    .or_else(|| base.strip_suffix("/api"))
                    .unwrap_or(base);
                format!("{root}/api")
            }
        }
    }

    pub fn chat_url(&self) -> String {
        let root = self.api_root();
        match self.dialect {
            Dialect::OpenAi | Dialect::OpenWebUi => format!("{root}/chat/completions"),
            Dialect::Ollama => format!("{root}/chat"),
        }
    }

    pub fn models_url(&self) -> String {
        let root = self.api_root();
        match self.dialect {
            Dialect::OpenAi | Dialect::OpenWebUi => format!("{root}/models"),
            Dialect::Ollama => format!("{root}/tags"),
        }
    }

    fn openrouter(&self) -> bool {
        self.dialect == Dialect::OpenAi && is_openrouter(&self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        if self.openrouter() {
            builder = builder.header("HTTP-Referer", REFERER).header("X-Title", TITLE);
        }
        builder
    }

    /// Build the JSON body for this dialect.
    fn body(&self, request: &ChatCompletionRequest, stream: bool) -> Result<Value> {
        if self.dialect == Dialect::Ollama {
            let mut ollama = openai_to_ollama(request);
            ollama.stream = Some(stream);
            return Ok(serde_json::to_value(ollama)?);
        }

        let mut request = request.clone();
        request.stream = Some(stream);
        // Only OpenAI itself and OpenRouter are known to accept these
        let usage_capable = self.dialect == Dialect::OpenAi
            && (self.base_url.contains("api.openai.com") || self.openrouter());
        if !stream || !usage_capable {
            request.stream_options = None;
        }
        if !self.openrouter() {
            request.provider = None;
        }
        Ok(serde_json::to_value(request)?)
    }

    async fn send_chat(&self, body: &Value, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let url = self.chat_url();
        tracing::debug!(url = %url, dialect = %self.dialect, "POST chat");

        let mut builder = self.request(reqwest::Method::POST, &url).json(body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "Upstream request failed");
            ProxyError::transport(format!("request to {url} failed: {e}"))
        })?;

        ensure_success(response).await
    }

    fn parse_chunk(&self, value: Value, adapter: &mut OllamaChunkAdapter) -> Option<(ChatCompletionChunk, bool)> {
        match self.dialect {
            Dialect::Ollama => {
                let line: OllamaChatResponse = from_frame(value)?;
                let done = line.done;
                Some((adapter.adapt(&line), done))
            }
            Dialect::OpenWebUi => {
                let mut value = value;
                normalize_tool_calls(&mut value);
                from_frame(value).map(|chunk| (chunk, false))
            }
            Dialect::OpenAi => from_frame(value).map(|chunk| (chunk, false)),
        }
    }

    fn frames(&self, response: reqwest::Response) -> BoxStream<'static, Result<Frame>> {
        match self.dialect {
            Dialect::Ollama => ndjson_frames(response.bytes_stream()),
            Dialect::OpenAi | Dialect::OpenWebUi => sse_frames(response.bytes_stream()),
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn list_models(&self) -> Result<Vec<DiscoveredModel>> {
        let url = self.models_url();
        let response = self
            .request(reqwest::Method::GET, &url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| ProxyError::transport(format!("request to {url} failed: {e}")))?;
        let body = ensure_success(response).await?.text().await?;

        let models = match self.dialect {
            Dialect::Ollama => {
                let tags: OllamaTagList = serde_json::from_str(&body)?;
                tags.models
                    .into_iter()
                    .map(|tag| {
                        let details = tag.details.unwrap_or_default();
                        DiscoveredModel {
                            id: tag.name,
                            created: None,
                            owned_by: None,
                            family: non_empty(details.family),
                            quantization: non_empty(details.quantization_level),
                            size: (tag.size > 0).then_some(tag.size),
                            modified_at: non_empty(tag.modified_at),
                            digest: non_empty(tag.digest),
                        }
                    })
                    .collect()
            }
            Dialect::OpenAi | Dialect::OpenWebUi => {
                let list: UpstreamModelList = serde_json::from_str(&body)?;
                list.data
                    .into_iter()
                    .map(|m| DiscoveredModel {
                        id: m.id,
                        created: m.created,
                        owned_by: m.owned_by,
                        ..DiscoveredModel::default()
                    })
                    .collect()
            }
        };

        Ok(models)
    }

    async fn chat(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let body = self.body(request, false)?;
        let response = self.send_chat(&body, Some(self.request_timeout)).await?;
        let text = response.text().await?;

        let parsed = match self.dialect {
            Dialect::Ollama => serde_json::from_str::<OllamaChatResponse>(&text)
                .map(|r| ollama_to_openai_response(&r)),
            Dialect::OpenWebUi => serde_json::from_str::<Value>(&text).and_then(|mut v| {
                normalize_tool_calls(&mut v);
                serde_json::from_value(v)
            }),
            Dialect::OpenAi => serde_json::from_str::<ChatCompletionResponse>(&text),
        };

        parsed.map_err(|e| {
            ProxyError::conversion(format!(
                "unrecognized {} response: {e}. Body: {}",
                self.dialect,
                truncate(&text, 300)
            ))
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamEnd> {
        let body = self.body(request, true)?;
        let response = self.send_chat(&body, None).await?;
        let mut frames = self.frames(response);
        let mut adapter = OllamaChunkAdapter::new();

        loop {
            let next = tokio::time::timeout(self.stream_idle_timeout, frames.next())
                .await
                .map_err(|_| {
                    ProxyError::transport(format!(
                        "no data from upstream for {}s",
                        self.stream_idle_timeout.as_secs()
                    ))
                })?;

            let data = match next {
                None | Some(Ok(Frame::Done)) => return Ok(StreamEnd::Completed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Frame::Data(data))) => data,
            };

            let Some(value) = parse_payload(&data) else {
                continue;
            };
            let Some((chunk, done)) = self.parse_chunk(value?, &mut adapter) else {
                continue;
            };

            if sink.accept(chunk).await == Flow::Stopped {
                tracing::debug!("Downstream client disconnected, closing upstream stream");
                return Ok(StreamEnd::Disconnected);
            }
            if done {
                return Ok(StreamEnd::Completed);
            }
        }
    }
}

/// Turn a non-2xx response into [`ProxyError::Upstream`] carrying the body.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %truncate(&body, 300), "Upstream returned error");
    Err(ProxyError::upstream(status.as_u16(), body))
}

fn from_frame<T: serde::de::DeserializeOwned>(value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping frame with unexpected shape");
            None
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
