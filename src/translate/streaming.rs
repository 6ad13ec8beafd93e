//! State machine for translating `OpenAI` streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] processes `ChatCompletionChunk`s one at a time,
//! tracking which content block is open, and emits the corresponding
//! Anthropic stream events (`message_start`, `content_block_delta`, etc.).
//!
//! One translator belongs to exactly one call. Output depends only on the
//! chunks fed in, so replaying a chunk sequence reproduces the same events.
//! At most one content block is open at a time; every `content_block_start`
//! is matched by a `content_block_stop` before the next block starts, and the
//! block index advances once per closed block.
//!
//! Parallel tool calls may arrive interleaved. A call that shows up while
//! another call's arguments are still incomplete is buffered and emitted as
//! its own block once the open one is done, so every block carries its
//! upstream id and name and its argument deltas concatenate to valid JSON.

use std::collections::HashMap;

use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent, Usage,
};
use super::openai_types::{ChatCompletionChunk, ChunkToolCall};
use super::response::map_finish_reason;

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    /// Position in `StreamTranslator::tool_calls`.
    ToolUse(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CallState {
    /// Seen but not yet emitted; arguments are buffered.
    Pending,
    Open,
    Closed,
}

/// One upstream tool call, tracked by its position in the `tool_calls` delta.
#[derive(Debug)]
struct ToolCallState {
    upstream_index: u64,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    state: CallState,
}

impl ToolCallState {
    fn new(upstream_index: u64) -> Self {
        Self {
            upstream_index,
            id: None,
            name: None,
            arguments: String::new(),
            state: CallState::Pending,
        }
    }

    fn arguments_complete(&self) -> bool {
        !self.arguments.trim().is_empty()
            && serde_json::from_str::<serde_json::Value>(&self.arguments).is_ok()
    }

    fn content_block(&self) -> ResponseContentBlock {
        ResponseContentBlock::ToolUse {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", self.upstream_index)),
            name: self.name.clone().unwrap_or_default(),
            input: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Translates one upstream chunk stream into Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("claude-sonnet-4-20250514", "msg_fallback");
///   for chunk in openai_chunks {
///       let events = translator.process_chunk(&chunk);
///       // send each event as SSE
///   }
///   let tail = translator.finish();          // on [DONE] / end of body
///   let stop = translator.message_stop();    // unless the call is left open
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    fallback_id: String,
    msg_id: Option<String>,
    started: bool,
    block: Option<OpenBlock>,
    block_index: usize,
    tool_calls: Vec<ToolCallState>,
    by_index: HashMap<u64, usize>,
    delta_sent: bool,
    stopped: bool,
    tool_use_detected: bool,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamTranslator {
    /// `fallback_id` is used as the message id when the upstream never sends one.
    pub fn new(model: &str, fallback_id: &str) -> Self {
        Self {
            model: model.to_string(),
            fallback_id: fallback_id.to_string(),
            msg_id: None,
            started: false,
            block: None,
            block_index: 0,
            tool_calls: Vec::new(),
            by_index: HashMap::new(),
            delta_sent: false,
            stopped: false,
            tool_use_detected: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Whether any tool-call content was seen during the call.
    pub fn tool_use_detected(&self) -> bool {
        self.tool_use_detected
    }

    /// Process a single `OpenAI` streaming chunk, returning zero or more Anthropic SSE events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(ref usage) = chunk.usage {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }

        if self.msg_id.is_none() && !chunk.id.is_empty() {
            self.msg_id = Some(format!("msg_{}", chunk.id.trim_start_matches("chatcmpl-")));
        }

        // Anything after the finish signal is trailing usage or noise
        if self.delta_sent || self.stopped {
            return events;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if choice.delta.role.is_some() {
            self.ensure_started(&mut events);
        }

        if let Some(text) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
            self.ensure_started(&mut events);
            if !matches!(self.block, Some(OpenBlock::Text)) {
                self.close_block(&mut events);
                self.flush_pending_calls(&mut events);
                self.open_block(
                    &mut events,
                    OpenBlock::Text,
                    ResponseContentBlock::Text {
                        text: String::new(),
                    },
                );
            }
            events.push(StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: Delta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            self.process_tool_fragment(&mut events, tc);
        }

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            if reason == "tool_calls" || reason == "function_call" {
                self.tool_use_detected = true;
            }
            self.ensure_started(&mut events);
            self.close_block(&mut events);
            self.flush_pending_calls(&mut events);
            events.push(self.message_delta(map_finish_reason(Some(reason))));
        }

        events
    }

    /// Call when the upstream stream ends (`[DONE]` or end of body). Closes a
    /// block left open and supplies the message-level events the upstream
    /// never triggered. Does not emit `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.stopped {
            return events;
        }

        self.ensure_started(&mut events);
        self.close_block(&mut events);
        self.flush_pending_calls(&mut events);
        if !self.delta_sent {
            events.push(self.message_delta(map_finish_reason(None)));
        }
        events
    }

    /// The closing `message_stop` event, produced at most once.
    pub fn message_stop(&mut self) -> Option<StreamEvent> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        Some(StreamEvent::MessageStop)
    }

    fn process_tool_fragment(&mut self, events: &mut Vec<StreamEvent>, tc: &ChunkToolCall) {
        let id = tc.id.as_deref().filter(|s| !s.is_empty());
        let name = tc
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|s| !s.is_empty());
        let args = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .filter(|s| !s.is_empty());

        if id.is_none() && name.is_none() && args.is_none() {
            return;
        }
        self.tool_use_detected = true;
        self.ensure_started(events);

        // A different id at a known index is a new call reusing the index
        let known = self.by_index.get(&tc.index).copied().filter(|&pos| {
            match (id, self.tool_calls[pos].id.as_deref()) {
                (Some(new), Some(old)) => new == old,
                _ => true,
            }
        });
        let pos = known.unwrap_or_else(|| {
            self.tool_calls.push(ToolCallState::new(tc.index));
            let pos = self.tool_calls.len() - 1;
            self.by_index.insert(tc.index, pos);
            pos
        });

        let call = &mut self.tool_calls[pos];
        if call.id.is_none() {
            call.id = id.map(str::to_string);
        }
        if call.name.is_none() {
            call.name = name.map(str::to_string);
        }
        if let Some(args) = args {
            call.arguments.push_str(args);
        }

        let state = call.state;
        match state {
            CallState::Open => {
                if let Some(args) = args {
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.block_index,
                        delta: Delta::InputJsonDelta {
                            partial_json: args.to_string(),
                        },
                    });
                }
            }
            CallState::Pending => {
                let can_open = match self.block {
                    Some(OpenBlock::ToolUse(open)) => self.tool_calls[open].arguments_complete(),
                    Some(OpenBlock::Text) | None => true,
                };
                if can_open {
                    self.close_block(events);
                    self.open_tool_call(events, pos);
                }
            }
            CallState::Closed => {
                tracing::debug!(index = tc.index, "Dropping fragment for a finished tool call");
            }
        }
    }

    /// Open a block for a tracked call and emit everything buffered for it.
    fn open_tool_call(&mut self, events: &mut Vec<StreamEvent>, pos: usize) {
        let call = &mut self.tool_calls[pos];
        call.state = CallState::Open;
        let content_block = call.content_block();
        let buffered = (!call.arguments.is_empty()).then(|| call.arguments.clone());

        self.open_block(events, OpenBlock::ToolUse(pos), content_block);
        if let Some(partial_json) = buffered {
            events.push(StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: Delta::InputJsonDelta { partial_json },
            });
        }
    }

    /// Emit buffered calls, each as a complete block, in arrival order.
    fn flush_pending_calls(&mut self, events: &mut Vec<StreamEvent>) {
        for pos in 0..self.tool_calls.len() {
            if self.tool_calls[pos].state == CallState::Pending {
                self.open_tool_call(events, pos);
                self.close_block(events);
            }
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self
                    .msg_id
                    .clone()
                    .unwrap_or_else(|| self.fallback_id.clone()),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        });
    }

    fn open_block(
        &mut self,
        events: &mut Vec<StreamEvent>,
        block: OpenBlock,
        content_block: ResponseContentBlock,
    ) {
        events.push(StreamEvent::ContentBlockStart {
            index: self.block_index,
            content_block,
        });
        self.block = Some(block);
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(block) = self.block.take() {
            if let OpenBlock::ToolUse(pos) = block {
                self.tool_calls[pos].state = CallState::Closed;
            }
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.block_index += 1;
        }
    }

    fn message_delta(&mut self, stop_reason: &str) -> StreamEvent {
        self.delta_sent = true;
        StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.output_tokens,
            },
        }
    }
}
