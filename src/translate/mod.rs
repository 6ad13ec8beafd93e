//! API translation between the Anthropic, `OpenAI` and Ollama chat formats.
//!
//! The core of the proxy: converts requests, responses, and streaming events
//! between the wire formats. All translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod ollama_stream;
pub mod ollama_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod tool_dialect;
