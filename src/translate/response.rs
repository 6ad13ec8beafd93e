use super::anthropic_types::{ErrorResponse, MessagesResponse, ResponseContentBlock, Usage};
use super::ollama_types::{OllamaChatResponse, OllamaMessage};
use super::openai_types::{
    ChatCompletionResponse, ChatErrorResponse, ChatToolCall, ChatToolCallFunction, ChatUsage,
    Choice, ChoiceMessage,
};
use super::tool_dialect::{arguments_to_string, arguments_to_value, openai_tool_calls_to_ollama};
use crate::error::{ProxyError, Result};

/// Translate an `OpenAI` Chat Completion response into an Anthropic Messages response.
/// Pure function: `original_model` is what the client originally requested.
///
/// A response without choices has no recognizable shape and is rejected;
/// a single unparsable tool argument string degrades to `{}`.
pub fn openai_to_anthropic(
    resp: &ChatCompletionResponse,
    original_model: &str,
) -> Result<MessagesResponse> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| ProxyError::conversion("upstream response has no choices"))?;

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(ref text) = choice.message.content {
        if !text.is_empty() {
            content.push(ResponseContentBlock::Text { text: text.clone() });
        }
    }

    for (i, tc) in choice.message.tool_calls.iter().flatten().enumerate() {
        let id = if tc.id.is_empty() {
            format!("call_{i}")
        } else {
            tc.id.clone()
        };
        content.push(ResponseContentBlock::ToolUse {
            id,
            name: tc.function.name.clone(),
            input: arguments_to_value(&tc.function.arguments),
        });
    }

    // Anthropic clients expect non-empty content
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = map_finish_reason(choice.finish_reason.as_deref());

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    let id = if resp.id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{}", resp.id.trim_start_matches("chatcmpl-"))
    };

    Ok(MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    })
}

/// Map an `OpenAI` `finish_reason` to an Anthropic `stop_reason`.
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("tool_calls" | "function_call") => "tool_use",
        _ => "end_turn",
    }
}

/// Translate an `OpenAI` error into an Anthropic error response
pub fn openai_error_to_anthropic(status: u16, err: &ChatErrorResponse) -> ErrorResponse {
    let error_type = match err.error.error_type.as_str() {
        "invalid_request_error" => "invalid_request_error",
        "rate_limit_error" | "rate_limit_exceeded" => "rate_limit_error",
        "authentication_error" => "authentication_error",
        "overloaded_error" => "overloaded_error",
        "server_error" | "internal_error" | "api_error" => "api_error",
        _ => return ErrorResponse::for_status(status, &err.error.message),
    };

    ErrorResponse::new(error_type, &err.error.message)
}

/// Wrap an upstream error body for an Anthropic client, re-tagging it when it
/// is an `OpenAI`-style error object and relaying it verbatim otherwise.
pub fn upstream_error_to_anthropic(status: u16, body: &str) -> ErrorResponse {
    match serde_json::from_str::<ChatErrorResponse>(body) {
        Ok(err) => openai_error_to_anthropic(status, &err),
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("upstream returned status {status}")
            } else {
                body.to_string()
            };
            ErrorResponse::for_status(status, message)
        }
    }
}

/// Translate an `OpenAI` Chat Completion response into an Ollama chat reply.
pub fn openai_to_ollama(
    resp: &ChatCompletionResponse,
    model: &str,
    created_at: &str,
) -> Result<OllamaChatResponse> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| ProxyError::conversion("upstream response has no choices"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(openai_tool_calls_to_ollama);

    let done_reason = match choice.finish_reason.as_deref() {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => "stop".to_string(),
    };

    Ok(OllamaChatResponse {
        model: model.to_string(),
        created_at: created_at.to_string(),
        message: OllamaMessage {
            role: "assistant".to_string(),
            content: choice.message.content.clone().unwrap_or_default(),
            tool_calls,
            tool_name: None,
            tool_call_id: None,
        },
        done: true,
        done_reason: Some(done_reason),
        prompt_eval_count: resp.usage.as_ref().map(|u| u.prompt_tokens),
        eval_count: resp.usage.as_ref().map(|u| u.completion_tokens),
    })
}

/// Normalize a complete reply from an Ollama-native backend into the `OpenAI`
/// completion shape. Ollama tool calls carry no id, so each gets a fresh one.
pub fn ollama_to_openai_response(resp: &OllamaChatResponse) -> ChatCompletionResponse {
    let tool_calls: Vec<ChatToolCall> = resp
        .message
        .tool_calls
        .iter()
        .flatten()
        .map(|call| ChatToolCall {
            id: call.id.clone().unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: call.function.name.clone(),
                arguments: arguments_to_string(&call.function.arguments),
            },
        })
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        resp.done_reason.clone().unwrap_or_else(|| "stop".to_string())
    } else {
        "tool_calls".to_string()
    };

    ChatCompletionResponse {
        id: String::new(),
        object: "chat.completion".to_string(),
        created: 0,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: Some(resp.message.content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(ChatUsage::new(
            resp.prompt_eval_count.unwrap_or(0),
            resp.eval_count.unwrap_or(0),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::*;
    use serde_json::json;

    fn make_response(content: Option<String>, finish_reason: Option<String>) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-abc123".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: None,
                },
                finish_reason,
            }],
            usage: Some(ChatUsage::new(10, 20)),
        }
    }

    #[test]
    fn test_simple_text_response() {
        let resp = make_response(Some("Hello!".to_string()), Some("stop".to_string()));
        let result = openai_to_anthropic(&resp, "claude-sonnet-4-20250514").unwrap();

        assert_eq!(result.id, "msg_abc123");
        assert_eq!(result.role, "assistant");
        assert_eq!(result.model, "claude-sonnet-4-20250514");
        assert_eq!(result.stop_reason, Some("end_turn".to_string()));
        assert_eq!(
            result.content,
            vec![ResponseContentBlock::Text {
                text: "Hello!".to_string()
            }]
        );
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.usage.output_tokens, 20);
    }

    #[test]
    fn test_minimal_upstream_body() {
        // Only the fields a bare-bones backend is guaranteed to send
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]
        }))
        .unwrap();

        let result = openai_to_anthropic(&resp, "claude-3-sonnet").unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"], json!([{"type": "text", "text": "hello"}]));
        assert_eq!(json["stop_reason"], "end_turn");
        assert!(result.id.starts_with("msg_"));
    }

    #[test]
    fn test_tool_call_response() {
        let resp = ChatCompletionResponse {
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some("Let me check.".to_string()),
                    tool_calls: Some(vec![
                        ChatToolCall {
                            id: "call_abc".to_string(),
                            call_type: "function".to_string(),
                            function: ChatToolCallFunction {
                                name: "get_weather".to_string(),
                                arguments: "{\"city\":\"London\"}".to_string(),
                            },
                        },
                        ChatToolCall {
                            id: "call_def".to_string(),
                            call_type: "function".to_string(),
                            function: ChatToolCallFunction {
                                name: "noop".to_string(),
                                arguments: "not json".to_string(),
                            },
                        },
                    ]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
            ..make_response(None, None)
        };

        let result = openai_to_anthropic(&resp, "test-model").unwrap();

        assert_eq!(result.content.len(), 3);
        assert_eq!(result.stop_reason, Some("tool_use".to_string()));

        if let ResponseContentBlock::ToolUse { id, name, input } = &result.content[1] {
            assert_eq!(id, "call_abc");
            assert_eq!(name, "get_weather");
            assert_eq!(input["city"], "London");
        } else {
            panic!("Expected tool_use content block");
        }
        if let ResponseContentBlock::ToolUse { input, .. } = &result.content[2] {
            assert_eq!(input, &json!({}));
        } else {
            panic!("Expected tool_use content block");
        }
    }

    #[test]
    fn test_missing_choices_is_a_conversion_error() {
        let resp = ChatCompletionResponse {
            choices: vec![],
            ..make_response(None, None)
        };
        let err = openai_to_anthropic(&resp, "m").unwrap_err();
        assert!(matches!(err, ProxyError::Conversion { .. }));
        assert!(openai_to_ollama(&resp, "m", "now").is_err());
    }

    #[test]
    fn test_empty_message_still_has_one_block() {
        let resp = make_response(None, Some("stop".to_string()));
        let result = openai_to_anthropic(&resp, "m").unwrap();
        assert_eq!(result.content.len(), 1);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), "end_turn");
        assert_eq!(map_finish_reason(Some("length")), "end_turn");
        assert_eq!(map_finish_reason(Some("tool_calls")), "tool_use");
        assert_eq!(map_finish_reason(Some("function_call")), "tool_use");
        assert_eq!(map_finish_reason(None), "end_turn");
    }

    #[test]
    fn test_upstream_error_retagging() {
        let err = upstream_error_to_anthropic(
            429,
            r#"{"error":{"message":"Too many requests","type":"rate_limit_exceeded"}}"#,
        );
        assert_eq!(err.error.error_type, "rate_limit_error");
        assert_eq!(err.error.message, "Too many requests");

        let err = upstream_error_to_anthropic(502, "<html>bad gateway</html>");
        assert_eq!(err.error.error_type, "api_error");
        assert_eq!(err.error.message, "<html>bad gateway</html>");

        let err = upstream_error_to_anthropic(400, r#"{"error":{"message":"bad"}}"#);
        assert_eq!(err.error.error_type, "invalid_request_error");
    }

    #[test]
    fn test_openai_to_ollama_reply() {
        let mut resp = make_response(Some(String::new()), Some("tool_calls".to_string()));
        resp.choices[0].message.tool_calls = Some(vec![ChatToolCall {
            id: "call_1".to_string(),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: "ls".to_string(),
                arguments: r#"{"path":"/tmp"}"#.to_string(),
            },
        }]);

        let reply = openai_to_ollama(&resp, "llama3", "2026-01-01T00:00:00Z").unwrap();
        assert!(reply.done);
        assert_eq!(reply.done_reason.as_deref(), Some("tool_calls"));
        assert_eq!(reply.prompt_eval_count, Some(10));
        assert_eq!(reply.eval_count, Some(20));
        let calls = reply.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.arguments, json!({"path": "/tmp"}));
    }

    #[test]
    fn test_ollama_reply_normalizes_to_openai() {
        let reply: OllamaChatResponse = serde_json::from_value(json!({
            "model": "llama3",
            "created_at": "2026-01-01T00:00:00Z",
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "ls", "arguments": {"path": "/"}}}
            ]},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 4,
            "eval_count": 2
        }))
        .unwrap();

        let resp = ollama_to_openai_response(&reply);
        let choice = &resp.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.function.arguments, r#"{"path":"/"}"#);
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 6);
    }
}
