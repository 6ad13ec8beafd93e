//! Upstream backend clients.
//!
//! Every backend is reached through [`ProviderClient`]. The translation core
//! only ever sees `OpenAI`-shaped requests, responses and chunks; each
//! dialect's framing and tool-call quirks stay inside the client.

mod framing;
mod http;

pub use http::HttpProvider;

use async_trait::async_trait;

use crate::error::Result;
use crate::providers::Dialect;
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

/// Whether the downstream side still wants chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The downstream client went away; stop reading upstream.
    Stopped,
}

/// How a streaming call ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The upstream finished its stream.
    Completed,
    /// The sink reported [`Flow::Stopped`] and the upstream read was abandoned.
    Disconnected,
}

/// Receives upstream chunks in arrival order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, chunk: ChatCompletionChunk) -> Flow;
}

/// A model as reported by a backend, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveredModel {
    pub id: String,
    pub created: Option<u64>,
    pub owned_by: Option<String>,
    pub family: Option<String>,
    pub quantization: Option<String>,
    pub size: Option<u64>,
    pub modified_at: Option<String>,
    pub digest: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Base URL the client was configured with; keys the model cache.
    fn base_url(&self) -> &str;

    async fn list_models(&self) -> Result<Vec<DiscoveredModel>>;

    async fn chat(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse>;

    /// Stream a completion into `sink`, one chunk per upstream frame. Returns
    /// as soon as the sink answers [`Flow::Stopped`], dropping the upstream
    /// connection.
    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        sink: &mut dyn ChunkSink,
    ) -> Result<StreamEnd>;
}
