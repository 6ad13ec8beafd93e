//! Streaming conversions on the Ollama side of the proxy.
//!
//! [`OllamaStreamWriter`] turns `OpenAI` chunks into the NDJSON lines an Ollama
//! client expects. [`OllamaChunkAdapter`] goes the other way, normalizing the
//! lines of an Ollama-native backend into `OpenAI` chunks so every upstream
//! dialect feeds the same translators.

use std::collections::BTreeMap;

use super::ollama_types::{OllamaChatResponse, OllamaFunctionCall, OllamaMessage, OllamaToolCall};
use super::openai_types::{
    ChatCompletionChunk, ChatUsage, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use super::tool_dialect::{arguments_to_string, arguments_to_value};

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Writes Ollama NDJSON lines for one downstream call.
///
/// Text is forwarded as it arrives. Ollama clients expect whole tool calls
/// with object arguments, so fragments are assembled by upstream index and
/// released together just before the final `done:true` line.
#[derive(Debug)]
pub struct OllamaStreamWriter {
    model: String,
    created_at: String,
    calls: BTreeMap<u64, PendingCall>,
    finish_reason: Option<String>,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    done: bool,
}

impl OllamaStreamWriter {
    pub fn new(model: &str, created_at: &str) -> Self {
        Self {
            model: model.to_string(),
            created_at: created_at.to_string(),
            calls: BTreeMap::new(),
            finish_reason: None,
            prompt_tokens: None,
            completion_tokens: None,
            done: false,
        }
    }

    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<OllamaChatResponse> {
        if self.done {
            return Vec::new();
        }
        if let Some(ref usage) = chunk.usage {
            self.prompt_tokens = Some(usage.prompt_tokens);
            self.completion_tokens = Some(usage.completion_tokens);
        }
        let Some(choice) = chunk.choices.first() else {
            return Vec::new();
        };

        let mut lines = Vec::new();
        if let Some(text) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
            lines.push(self.line(text.to_string(), None, false));
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            let pending = self.calls.entry(tc.index).or_default();
            if let Some(id) = tc.id.as_deref().filter(|s| !s.is_empty()) {
                pending.id = id.to_string();
            }
            if let Some(ref func) = tc.function {
                if let Some(name) = func.name.as_deref().filter(|s| !s.is_empty()) {
                    pending.name = name.to_string();
                }
                if let Some(ref args) = func.arguments {
                    pending.arguments.push_str(args);
                }
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason.to_string());
        }

        lines
    }

    /// Flush assembled tool calls and emit the closing `done:true` line.
    pub fn finish(&mut self) -> Vec<OllamaChatResponse> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut lines = Vec::new();
        let calls: Vec<OllamaToolCall> = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| OllamaToolCall {
                id: (!c.id.is_empty()).then_some(c.id),
                function: OllamaFunctionCall {
                    name: c.name,
                    arguments: arguments_to_value(&c.arguments),
                },
            })
            .collect();
        let had_calls = !calls.is_empty();
        if had_calls {
            lines.push(self.line(String::new(), Some(calls), false));
        }

        let reason = match self.finish_reason.take() {
            Some(reason) => reason,
            None if had_calls => "tool_calls".to_string(),
            None => "stop".to_string(),
        };
        let mut last = self.line(String::new(), None, true);
        last.done_reason = Some(reason);
        last.prompt_eval_count = self.prompt_tokens;
        last.eval_count = self.completion_tokens;
        lines.push(last);
        lines
    }

    fn line(
        &self,
        content: String,
        tool_calls: Option<Vec<OllamaToolCall>>,
        done: bool,
    ) -> OllamaChatResponse {
        OllamaChatResponse {
            model: self.model.clone(),
            created_at: self.created_at.clone(),
            message: OllamaMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
                tool_name: None,
                tool_call_id: None,
            },
            done,
            done_reason: None,
            prompt_eval_count: None,
            eval_count: None,
        }
    }
}

/// Normalizes NDJSON lines from an Ollama-native backend into `OpenAI` chunks.
///
/// Ollama sends each tool call complete in one line and without an id; the
/// adapter gives every call a fresh id and its own index so the translators
/// see one opening fragment per call.
#[derive(Debug, Default)]
pub struct OllamaChunkAdapter {
    sent_role: bool,
    next_index: u64,
}

impl OllamaChunkAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapt(&mut self, line: &OllamaChatResponse) -> ChatCompletionChunk {
        let mut delta = ChunkDelta::default();
        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        if !line.message.content.is_empty() {
            delta.content = Some(line.message.content.clone());
        }

        let calls: Vec<ChunkToolCall> = line
            .message
            .tool_calls
            .iter()
            .flatten()
            .map(|call| {
                let index = self.next_index;
                self.next_index += 1;
                ChunkToolCall {
                    index,
                    id: Some(
                        call.id
                            .clone()
                            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    ),
                    call_type: Some("function".to_string()),
                    function: Some(ChunkToolCallFunction {
                        name: Some(call.function.name.clone()),
                        arguments: Some(arguments_to_string(&call.function.arguments)),
                    }),
                }
            })
            .collect();
        if !calls.is_empty() {
            delta.tool_calls = Some(calls);
        }

        let finish_reason = line.done.then(|| {
            if self.next_index > 0 {
                "tool_calls".to_string()
            } else {
                line.done_reason.clone().unwrap_or_else(|| "stop".to_string())
            }
        });

        let mut chunk = ChatCompletionChunk::single("", &line.model, delta, finish_reason);
        if line.done {
            chunk.usage = Some(ChatUsage::new(
                line.prompt_eval_count.unwrap_or(0),
                line.eval_count.unwrap_or(0),
            ));
        }
        chunk
    }
}
