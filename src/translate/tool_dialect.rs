//! Conversions between the Ollama and OpenAI tool-call shapes.
//!
//! OpenAI passes function arguments as a JSON-encoded string and correlates
//! results by call id. Ollama passes arguments as an object and has no ids, so
//! ids are synthesized on the way in and tool results are paired with them in
//! order.

use std::collections::VecDeque;

use serde_json::Value;

use super::ollama_types::{OllamaFunctionCall, OllamaMessage, OllamaToolCall};
use super::openai_types::{ChatMessage, ChatTool, ChatToolCall, ChatToolCallFunction};

/// Serialize tool arguments the way OpenAI expects them: a JSON string.
/// Strings are assumed to already be encoded and pass through untouched.
pub fn arguments_to_string(arguments: &Value) -> String {
    match arguments {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Decode OpenAI-style string arguments into an object. Empty or unparsable
/// input becomes `{}`.
pub fn arguments_to_value(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Tool arguments are not valid JSON, using empty object");
            Value::Object(serde_json::Map::new())
        }
    }
}

/// Parse Ollama tool definitions. Ollama already uses the OpenAI
/// `{type, function:{name, description, parameters}}` shape; entries that
/// don't fit are dropped.
pub fn tools_from_ollama(tools: &[Value]) -> Vec<ChatTool> {
    tools
        .iter()
        .filter_map(|t| match serde_json::from_value::<ChatTool>(t.clone()) {
            Ok(tool) => Some(tool),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping malformed Ollama tool definition");
                None
            }
        })
        .collect()
}

/// Rewrite Ollama-flavoured tool calls inside an OpenAI-shaped payload (a
/// completion or a stream chunk) in place: object arguments become strings
/// and missing `index`/`type` fields are filled in.
pub fn normalize_tool_calls(payload: &mut Value) {
    let Some(choices) = payload.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        for key in ["delta", "message"] {
            let calls = choice
                .get_mut(key)
                .and_then(|m| m.get_mut("tool_calls"))
                .and_then(Value::as_array_mut);
            let Some(calls) = calls else { continue };

            for (i, call) in calls.iter_mut().enumerate() {
                let Some(obj) = call.as_object_mut() else {
                    continue;
                };
                obj.entry("index").or_insert_with(|| Value::from(i));
                obj.entry("type")
                    .or_insert_with(|| Value::String("function".to_string()));
                if let Some(args) = obj
                    .get_mut("function")
                    .and_then(|f| f.as_object_mut())
                    .and_then(|f| f.get_mut("arguments"))
                {
                    if !args.is_string() {
                        *args = Value::String(arguments_to_string(args));
                    }
                }
            }
        }
    }
}

/// Convert an Ollama conversation into OpenAI chat messages.
///
/// Assistant tool calls without ids get `call_<n>` ids, numbered across the
/// whole conversation; each following `tool` message without an explicit id
/// takes the oldest unanswered one.
pub fn ollama_messages_to_openai(messages: &[OllamaMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut unanswered: VecDeque<String> = VecDeque::new();
    let mut next_id = 0usize;

    for msg in messages {
        match msg.role.as_str() {
            "assistant" => {
                let calls: Vec<ChatToolCall> = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|call| {
                        let id = call.id.clone().unwrap_or_else(|| {
                            let id = format!("call_{next_id}");
                            next_id += 1;
                            id
                        });
                        unanswered.push_back(id.clone());
                        ChatToolCall {
                            id,
                            call_type: "function".to_string(),
                            function: ChatToolCallFunction {
                                name: call.function.name.clone(),
                                arguments: arguments_to_string(&call.function.arguments),
                            },
                        }
                    })
                    .collect();

                let mut chat = ChatMessage::text("assistant", msg.content.clone());
                if msg.content.is_empty() {
                    chat.content = None;
                }
                if !calls.is_empty() {
                    chat.tool_calls = Some(calls);
                }
                out.push(chat);
            }
            "tool" => {
                let id = match &msg.tool_call_id {
                    Some(id) => {
                        unanswered.retain(|pending| pending != id);
                        id.clone()
                    }
                    None => unanswered.pop_front().unwrap_or_default(),
                };
                let mut chat = ChatMessage::tool_result(id, msg.content.clone());
                chat.name = msg.tool_name.clone();
                out.push(chat);
            }
            role => {
                if role == "user" {
                    unanswered.clear();
                }
                out.push(ChatMessage::text(role, msg.content.clone()));
            }
        }
    }

    out
}

/// Convert complete OpenAI tool calls into Ollama's shape.
pub fn openai_tool_calls_to_ollama(calls: &[ChatToolCall]) -> Vec<OllamaToolCall> {
    calls
        .iter()
        .map(|call| OllamaToolCall {
            id: (!call.id.is_empty()).then(|| call.id.clone()),
            function: OllamaFunctionCall {
                name: call.function.name.clone(),
                arguments: arguments_to_value(&call.function.arguments),
            },
        })
        .collect()
}
