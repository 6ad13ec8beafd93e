//! Translate downstream chat requests (Anthropic Messages, Ollama chat) into
//! `OpenAI` Chat Completions requests, and `OpenAI` requests into Ollama ones
//! for Ollama-native backends.
//!
//! A single Anthropic message can expand into multiple `OpenAI` messages (a user
//! message with `tool_result` blocks becomes separate `tool`-role messages).
//! Every built message list goes through [`validate_tool_pairing`] before it
//! leaves the proxy, since most backends reject a dangling tool call or result.

use std::collections::HashSet;

use super::anthropic_types::{
    ContentBlock, Message, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::ollama_types::{OllamaChatRequest, OllamaMessage, OllamaOptions};
use super::openai_types::{
    CacheControl, ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction,
    ChatToolChoiceSpecific, ContentPart, ImageUrlDetail, StreamOptions,
};
use super::tool_dialect::{ollama_messages_to_openai, openai_tool_calls_to_ollama, tools_from_ollama};
use crate::config::ProxyConfig;

/// Inserted between a tool result and a following user turn.
pub const TOOL_RESULTS_FILLER: &str = "I've processed the tool results.";

/// Resolve the model a client asked for into the upstream model name:
/// logical alias first, then an explicit `[models.map]` entry, then the
/// friendly-name mapping.
pub fn resolve_model(config: &ProxyConfig, requested: &str) -> String {
    let model = config.resolve_model_alias(requested);
    if let Some(mapped) = config.models.map.get(model) {
        return mapped.clone();
    }
    map_model(model)
}

/// Map friendly Anthropic model names onto vendor/model paths. Names that
/// already contain a `/` are passed through.
pub fn map_model(model: &str) -> String {
    if model.contains('/') {
        return model.to_string();
    }
    let lower = model.to_lowercase();
    let mapped = if lower.contains("haiku") {
        if lower.contains("3.5") {
            "anthropic/claude-3.5-haiku"
        } else {
            "anthropic/claude-3-haiku-20240307"
        }
    } else if lower.contains("sonnet") {
        if lower.contains("3.5") || lower.contains('4') {
            "anthropic/claude-3.5-sonnet"
        } else {
            "anthropic/claude-3-sonnet-20240229"
        }
    } else if lower.contains("opus") {
        "anthropic/claude-3-opus-20240229"
    } else {
        return model.to_string();
    };
    mapped.to_string()
}

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
/// Pure function: takes the request and the already-resolved upstream model.
pub fn anthropic_to_openai(req: &MessagesRequest, target_model: &str) -> ChatCompletionRequest {
    let has_tools = req.tools.as_ref().is_some_and(|t| !t.is_empty());
    let cacheable = target_model.to_lowercase().contains("claude");

    let mut messages: Vec<ChatMessage> = req
        .system
        .as_ref()
        .map(|system| {
            system
                .texts()
                .into_iter()
                .map(|text| system_message(text, cacheable))
                .collect()
        })
        .unwrap_or_default();

    for msg in &req.messages {
        messages.extend(translate_message(msg));
    }

    if !has_tools {
        for msg in &mut messages {
            msg.tool_calls = None;
        }
    }

    let tools = has_tools.then(|| {
        req.tools
            .iter()
            .flatten()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    let tool_choice = if has_tools {
        req.tool_choice.as_ref().map(translate_tool_choice)
    } else {
        None
    };

    let stream_options = req.stream.filter(|s| *s).map(|_| StreamOptions {
        include_usage: true,
    });

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    ChatCompletionRequest {
        model: target_model.to_string(),
        messages: insert_tool_fillers(validate_tool_pairing(messages)),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options,
        tools,
        tool_choice,
        stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        user,
        provider: None,
    }
}

/// Translate an Ollama chat request into an `OpenAI` Chat Completions request.
pub fn ollama_to_openai(req: &OllamaChatRequest, target_model: &str) -> ChatCompletionRequest {
    let tools = tools_from_ollama(&req.tools);
    let mut messages = ollama_messages_to_openai(&req.messages);
    if tools.is_empty() {
        for msg in &mut messages {
            msg.tool_calls = None;
        }
    }

    let options = req.options.clone().unwrap_or_default();
    let stream = req.wants_stream();

    ChatCompletionRequest {
        model: target_model.to_string(),
        messages: insert_tool_fillers(validate_tool_pairing(messages)),
        max_tokens: options.num_predict,
        temperature: options.temperature,
        top_p: options.top_p,
        stream: Some(stream),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: None,
        stop: options.stop.filter(|s| !s.is_empty()),
        user: None,
        provider: None,
    }
}

/// Reshape an `OpenAI` request for an Ollama-native `/api/chat` backend.
pub fn openai_to_ollama(req: &ChatCompletionRequest) -> OllamaChatRequest {
    let messages = req
        .messages
        .iter()
        .map(|m| OllamaMessage {
            role: m.role.clone(),
            content: m.text_content(),
            tool_calls: m
                .tool_calls
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(openai_tool_calls_to_ollama),
            tool_name: m.name.clone(),
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect();

    let tools = req
        .tools
        .iter()
        .flatten()
        .filter_map(|t| serde_json::to_value(t).ok())
        .collect();

    let options = OllamaOptions {
        temperature: req.temperature,
        top_p: req.top_p,
        num_predict: req.max_tokens,
        stop: req.stop.clone(),
    };
    let has_options = options.temperature.is_some()
        || options.top_p.is_some()
        || options.num_predict.is_some()
        || options.stop.is_some();

    OllamaChatRequest {
        model: req.model.clone(),
        messages,
        stream: Some(req.stream.unwrap_or(false)),
        tools,
        options: has_options.then_some(options),
        keep_alive: None,
    }
}

/// Drop tool calls and tool results that are not correctly paired.
///
/// An assistant message keeps only the calls answered by the run of `tool`
/// messages immediately after it, and disappears if it is left with neither
/// content nor calls. A `tool` message survives only when the nearest
/// preceding non-tool message is an assistant message carrying its call id.
/// Pairing is judged against the input list, not the partially filtered one.
pub fn validate_tool_pairing(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut validated = Vec::with_capacity(messages.len());

    for (i, msg) in messages.iter().enumerate() {
        match msg.role.as_str() {
            "assistant" => {
                let answered: HashSet<&str> = messages[i + 1..]
                    .iter()
                    .take_while(|m| m.role == "tool")
                    .filter_map(|m| m.tool_call_id.as_deref())
                    .collect();

                let mut kept = msg.clone();
                let calls: Vec<ChatToolCall> = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .filter(|c| {
                        let ok = answered.contains(c.id.as_str());
                        if !ok {
                            tracing::debug!(id = %c.id, "Dropping unanswered tool call");
                        }
                        ok
                    })
                    .cloned()
                    .collect();
                kept.tool_calls = (!calls.is_empty()).then_some(calls);

                if kept.has_content() || kept.has_tool_calls() {
                    validated.push(kept);
                } else {
                    tracing::debug!("Dropping empty assistant message");
                }
            }
            "tool" => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let owner = messages[..i].iter().rev().find(|m| m.role != "tool");
                let paired = owner.is_some_and(|m| {
                    m.role == "assistant"
                        && m.tool_calls.iter().flatten().any(|c| !id.is_empty() && c.id == id)
                });
                if paired {
                    validated.push(msg.clone());
                } else {
                    tracing::debug!(id, "Dropping orphaned tool result");
                }
            }
            _ => validated.push(msg.clone()),
        }
    }

    validated
}

/// Insert a short assistant turn wherever a tool result is directly followed
/// by a user message.
pub fn insert_tool_fillers(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if msg.role == "user" && out.last().is_some_and(|prev| prev.role == "tool") {
            out.push(ChatMessage::text("assistant", TOOL_RESULTS_FILLER));
        }
        out.push(msg);
    }
    out
}

fn system_message(text: &str, cacheable: bool) -> ChatMessage {
    ChatMessage {
        content: Some(ChatContent::Parts(vec![ContentPart::Text {
            text: text.to_string(),
            cache_control: cacheable.then(CacheControl::ephemeral),
        }])),
        ..ChatMessage::text("system", "")
    }
}

fn translate_message(msg: &Message) -> Vec<ChatMessage> {
    let blocks = msg.content.blocks();

    match msg.role {
        Role::User => translate_user_message(&blocks),
        Role::Assistant => translate_assistant_message(&blocks).into_iter().collect(),
    }
}

/// Tool results come out first as `tool` messages, followed by one user
/// message holding the remaining text and images (if any).
fn translate_user_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text {
                    text: text.clone(),
                    cache_control: None,
                });
            }
            ContentBlock::Image { source } => {
                let data_uri = format!("data:{};base64,{}", source.media_type, source.data);
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: data_uri,
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let result_text = tool_result_to_string(content.as_ref(), *is_error);
                messages.push(ChatMessage::tool_result(tool_use_id.clone(), result_text));
            }
            ContentBlock::ToolUse { .. } | ContentBlock::Unsupported => {}
        }
    }

    if !content_parts.is_empty() {
        messages.push(ChatMessage {
            content: Some(collapse_content_parts(content_parts)),
            ..ChatMessage::text("user", "")
        });
    }

    messages
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Option<ChatMessage> {
    let mut text = String::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: if input.is_null() {
                            "{}".to_string()
                        } else {
                            input.to_string()
                        },
                    },
                });
            }
            ContentBlock::Image { .. }
            | ContentBlock::ToolResult { .. }
            | ContentBlock::Unsupported => {}
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return None;
    }

    Some(ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        name: None,
    })
}

fn collapse_content_parts(parts: Vec<ContentPart>) -> ChatContent {
    if let [ContentPart::Text { text, .. }] = parts.as_slice() {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts)
}

fn tool_result_to_string(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) {
        "ERROR: "
    } else {
        ""
    };

    match content {
        Some(ToolResultContent::Text(t)) => format!("{prefix}{t}"),
        Some(ToolResultContent::Blocks(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{prefix}{text}")
        }
        None => format!("{prefix}(no content)"),
    }
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoice::Any => ChatToolChoice::String("required".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Tool { name } => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    }
}
