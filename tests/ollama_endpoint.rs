mod harness;

use dialect_proxy::providers::Dialect;
use harness::{
    chunk, completion, config_for, event_names, parse_ndjson, parse_sse, start_proxy, text_stream,
    tool_call_stream, user_message, MockUpstream, Reply,
};
use serde_json::{json, Value};
use tokio_test::assert_ok;

async fn post_chat(proxy: &harness::Proxy, body: &Value) -> reqwest::Response {
    assert_ok!(
        proxy
            .client
            .post(format!("{}/api/chat", proxy.url))
            .json(body)
            .send()
            .await
    )
}

fn ollama_chat(model: &str, text: &str, stream: Option<bool>) -> Value {
    let mut body = json!({"model": model, "messages": [{"role": "user", "content": text}]});
    if let Some(stream) = stream {
        body["stream"] = json!(stream);
    }
    body
}

#[tokio::test]
async fn test_non_streaming_chat() {
    let upstream = MockUpstream::start(Reply::Json(200, completion("hello", "stop"))).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let resp = post_chat(&proxy, &ollama_chat("llama3", "hi", Some(false))).await;
    assert_eq!(resp.status(), 200);
    let body: Value = assert_ok!(resp.json().await);

    assert_eq!(body["model"], "llama3");
    assert_eq!(body["message"]["role"], "assistant");
    assert_eq!(body["message"]["content"], "hello");
    assert_eq!(body["done"], true);
    assert_eq!(body["done_reason"], "stop");
    assert_eq!(body["prompt_eval_count"], 12);
    assert!(body["created_at"].as_str().is_some_and(|s| !s.is_empty()));

    assert_eq!(upstream.chat_requests()[0]["stream"], false);
}

#[tokio::test]
async fn test_streaming_is_the_default() {
    let upstream = MockUpstream::start(Reply::Sse(text_stream(&["Hel", "lo"]))).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let resp = post_chat(&proxy, &ollama_chat("llama3", "hi", None)).await;
    assert_eq!(resp.headers()["content-type"], "application/x-ndjson");

    let lines = parse_ndjson(&assert_ok!(resp.text().await));
    assert_eq!(lines.len(), 3);
    assert!(lines[..2].iter().all(|l| l["done"] == false));
    let text: String = lines
        .iter()
        .map(|l| l["message"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(text, "Hello");

    let last = lines.last().unwrap();
    assert_eq!(last["done"], true);
    assert_eq!(last["done_reason"], "stop");

    assert_eq!(upstream.chat_requests()[0]["stream"], true);
}

#[tokio::test]
async fn test_streamed_tool_calls_arrive_whole() {
    let upstream = MockUpstream::start(Reply::Sse(tool_call_stream())).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let request = json!({
        "model": "llama3",
        "messages": [{"role": "user", "content": "weather?"}],
        "tools": [{"type": "function", "function": {
            "name": "get_weather",
            "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
        }}]
    });
    let lines = parse_ndjson(&assert_ok!(post_chat(&proxy, &request).await.text().await));

    assert_eq!(lines.len(), 2);
    let calls = &lines[0]["message"]["tool_calls"];
    assert_eq!(calls[0]["function"]["name"], "get_weather");
    assert_eq!(calls[0]["function"]["arguments"], json!({"city": "London"}));
    assert_eq!(lines[1]["done"], true);
    assert_eq!(lines[1]["done_reason"], "tool_calls");

    let sent = &upstream.chat_requests()[0];
    assert_eq!(sent["tools"][0]["function"]["name"], "get_weather");
}

#[tokio::test]
async fn test_tool_history_gets_ids_and_fillers() {
    let upstream = MockUpstream::start(Reply::Json(200, completion("Sunny.", "stop"))).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let request = json!({
        "model": "llama3",
        "stream": false,
        "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}],
        "messages": [
            {"role": "user", "content": "weather?"},
            {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_weather", "arguments": {"city": "London"}}}
            ]},
            {"role": "tool", "content": "sunny", "tool_name": "get_weather"},
            {"role": "user", "content": "and tomorrow?"}
        ]
    });
    let resp = post_chat(&proxy, &request).await;
    assert_eq!(resp.status(), 200);

    let sent = &upstream.chat_requests()[0];
    let messages = sent["messages"].as_array().unwrap();
    let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "assistant", "user"]);

    let call_id = messages[1]["tool_calls"][0]["id"].as_str().unwrap();
    assert!(!call_id.is_empty());
    assert_eq!(messages[2]["tool_call_id"], call_id);
    assert_eq!(
        messages[1]["tool_calls"][0]["function"]["arguments"],
        r#"{"city":"London"}"#
    );
}

#[tokio::test]
async fn test_streaming_error_line() {
    let upstream = MockUpstream::start(Reply::Json(404, json!({"error": "model not found"}))).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let lines = parse_ndjson(&assert_ok!(
        post_chat(&proxy, &ollama_chat("nope", "hi", None)).await.text().await
    ));
    assert_eq!(lines.len(), 1);
    assert!(lines[0]["error"].as_str().unwrap().contains("model not found"));
}

#[tokio::test]
async fn test_non_streaming_error_uses_ollama_shape() {
    let upstream = MockUpstream::start(Reply::Json(404, json!({"error": "model not found"}))).await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let resp = post_chat(&proxy, &ollama_chat("nope", "hi", Some(false))).await;
    assert_eq!(resp.status(), 404);
    let body: Value = assert_ok!(resp.json().await);
    assert!(body["error"].as_str().unwrap().contains("model not found"));

    let resp = post_chat(&proxy, &json!({"model": "", "messages": []})).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_ollama_native_backend() {
    let upstream = MockUpstream::start(Reply::Ndjson(vec![
        json!({"model": "llama3", "created_at": "t", "message": {"role": "assistant", "content": "Hel"}, "done": false}),
        json!({"model": "llama3", "created_at": "t", "message": {"role": "assistant", "content": "lo"}, "done": false}),
        json!({"model": "llama3", "created_at": "t", "message": {"role": "assistant", "content": ""},
               "done": true, "done_reason": "stop", "prompt_eval_count": 5, "eval_count": 2}),
    ]))
    .await;
    let proxy = start_proxy(config_for(Dialect::Ollama, &upstream.url)).await;

    let resp = assert_ok!(
        proxy
            .client
            .post(format!("{}/v1/messages", proxy.url))
            .json(&user_message("llama3", "hi", true))
            .send()
            .await
    );
    let events = parse_sse(&assert_ok!(resp.text().await));
    let text: String = events
        .iter()
        .filter(|(n, _)| n == "content_block_delta")
        .map(|(_, d)| d["delta"]["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text, "Hello");
    assert_eq!(event_names(&events).last(), Some(&"message_stop"));

    let delta = &events.iter().find(|(n, _)| n == "message_delta").unwrap().1;
    assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    assert_eq!(delta["usage"]["output_tokens"], 2);

    let sent = &upstream.chat_requests()[0];
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["messages"][0]["content"], "hi");
    assert!(sent.get("stream_options").is_none());
}

#[tokio::test]
async fn test_ollama_native_tool_call_non_streaming() {
    let upstream = MockUpstream::start(Reply::Json(
        200,
        json!({
            "model": "llama3", "created_at": "t",
            "message": {"role": "assistant", "content": "", "tool_calls": [
                {"function": {"name": "get_weather", "arguments": {"city": "Paris"}}}
            ]},
            "done": true, "done_reason": "stop"
        }),
    ))
    .await;
    let proxy = start_proxy(config_for(Dialect::Ollama, &upstream.url)).await;

    let request = json!({
        "model": "llama3",
        "max_tokens": 100,
        "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
        "messages": [{"role": "user", "content": "weather in Paris?"}]
    });
    let resp = assert_ok!(
        proxy
            .client
            .post(format!("{}/v1/messages", proxy.url))
            .json(&request)
            .send()
            .await
    );
    let body: Value = assert_ok!(resp.json().await);

    assert_eq!(body["stop_reason"], "tool_use");
    assert_eq!(body["content"][0]["type"], "tool_use");
    assert_eq!(body["content"][0]["name"], "get_weather");
    assert_eq!(body["content"][0]["input"], json!({"city": "Paris"}));
    assert!(body["content"][0]["id"].as_str().unwrap().starts_with("call_"));
}

#[tokio::test]
async fn test_openwebui_tool_calls_are_normalized() {
    let upstream = MockUpstream::start(Reply::Sse(vec![
        chunk(json!({"role": "assistant"}), None),
        chunk(
            json!({"tool_calls": [{"id": "call_w1", "function": {"name": "ls", "arguments": {"path": "/tmp"}}}]}),
            None,
        ),
        chunk(json!({}), Some("tool_calls")),
    ]))
    .await;
    let proxy = start_proxy(config_for(Dialect::OpenWebUi, &upstream.url)).await;

    let resp = assert_ok!(
        proxy
            .client
            .post(format!("{}/v1/messages", proxy.url))
            .json(&user_message("llama3", "list /tmp", true))
            .send()
            .await
    );
    let events = parse_sse(&assert_ok!(resp.text().await));

    let start = &events.iter().find(|(n, _)| n == "content_block_start").unwrap().1;
    assert_eq!(start["content_block"]["id"], "call_w1");
    let delta = &events.iter().find(|(n, _)| n == "content_block_delta").unwrap().1;
    let input: Value = assert_ok!(serde_json::from_str(delta["delta"]["partial_json"].as_str().unwrap()));
    assert_eq!(input, json!({"path": "/tmp"}));
}

#[tokio::test]
async fn test_client_disconnect_closes_upstream_stream() {
    let upstream = MockUpstream::start(Reply::Endless(vec![
        chunk(json!({"role": "assistant"}), None),
        chunk(json!({"content": "Hi"}), None),
    ]))
    .await;
    let stream_closed = upstream.stream_closed();
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let mut resp = post_chat(&proxy, &ollama_chat("llama3", "hi", None)).await;
    assert_eq!(resp.status(), 200);
    let first = assert_ok!(resp.chunk().await).expect("stream ended early");
    let text = String::from_utf8_lossy(&first).to_string();
    let lines = parse_ndjson(&text);
    assert_eq!(lines[0]["done"], false);

    drop(resp);

    let torn_down =
        tokio::time::timeout(std::time::Duration::from_secs(5), stream_closed.cancelled()).await;
    assert!(torn_down.is_ok(), "upstream body still being read after the client left");
    assert_eq!(upstream.chat_requests().len(), 1);
}

#[tokio::test]
async fn test_tags_come_from_the_backend() {
    let upstream = MockUpstream::start_with_models(
        Reply::Json(200, completion("unused", "stop")),
        Reply::Json(
            200,
            json!({"object": "list", "data": [
                {"id": "gpt-4o", "object": "model", "owned_by": "openai"},
                {"id": "gpt-4o-mini"}
            ]}),
        ),
    )
    .await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    for _ in 0..2 {
        let tags: Value = assert_ok!(
            assert_ok!(proxy.client.get(format!("{}/api/tags", proxy.url)).send().await)
                .json()
                .await
        );
        let names: Vec<&str> = tags["models"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["gpt-4o", "gpt-4o-mini"]);
        assert!(tags["models"][0]["modified_at"].is_string());
    }

    // Second listing is served from the cache
    assert_eq!(upstream.model_requests(), 1);
}

#[tokio::test]
async fn test_model_records_listing_is_fully_populated() {
    let upstream = MockUpstream::start_with_models(
        Reply::Json(200, completion("unused", "stop")),
        Reply::Json(
            200,
            json!({"object": "list", "data": [
                {"id": "gpt-4o", "object": "model", "owned_by": "openai", "created": 1700000000},
                {"id": "gpt-4o-mini"}
            ]}),
        ),
    )
    .await;
    let proxy = start_proxy(config_for(Dialect::OpenAi, &upstream.url)).await;

    let list: Value = assert_ok!(
        assert_ok!(proxy.client.get(format!("{}/api/v0/models", proxy.url)).send().await)
            .json()
            .await
    );
    assert_eq!(list["object"], "list");
    let records = list["data"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "gpt-4o");
    assert_eq!(records[0]["publisher"], "openai");
    assert_eq!(records[0]["created"], 1_700_000_000);
    for record in records {
        assert_eq!(record["object"], "model");
        assert_eq!(record["type"], "llm");
        assert_eq!(record["arch"], "transformer");
        assert_eq!(record["state"], "loaded");
        assert_eq!(record["max_context_length"], 4096);
        assert!(record["publisher"].is_string());
        assert!(record["quantization"].is_string());
    }

    // Shares the cached listing with /api/tags
    let tags = assert_ok!(proxy.client.get(format!("{}/api/tags", proxy.url)).send().await);
    assert_eq!(tags.status(), 200);
    assert_eq!(upstream.model_requests(), 1);
}

#[tokio::test]
async fn test_tags_fall_back_when_backend_rejects_listing() {
    let upstream = MockUpstream::start_with_models(
        Reply::Json(200, completion("unused", "stop")),
        Reply::Json(401, json!({"error": {"message": "bad key"}})),
    )
    .await;
    let mut config = config_for(Dialect::OpenAi, &upstream.url);
    config.models.default = Some("fallback-model".to_string());
    let proxy = start_proxy(config).await;

    let tags: Value = assert_ok!(
        assert_ok!(proxy.client.get(format!("{}/api/tags", proxy.url)).send().await)
            .json()
            .await
    );
    assert_eq!(tags["models"].as_array().unwrap().len(), 1);
    assert_eq!(tags["models"][0]["name"], "fallback-model");
    // A 4xx is not retried
    assert_eq!(upstream.model_requests(), 1);
}

#[tokio::test]
async fn test_probe_endpoints() {
    let proxy = start_proxy(config_for(Dialect::Ollama, "http://127.0.0.1:9")).await;

    let root = assert_ok!(proxy.client.get(&proxy.url).send().await);
    assert_eq!(assert_ok!(root.text().await), "Ollama is running");

    let head = assert_ok!(proxy.client.head(&proxy.url).send().await);
    assert_eq!(head.status(), 200);

    let show: Value = assert_ok!(
        assert_ok!(
            proxy
                .client
                .post(format!("{}/api/show", proxy.url))
                .json(&json!({"model": "llama3"}))
                .send()
                .await
        )
        .json()
        .await
    );
    assert_eq!(show["details"]["family"], "proxy");
    assert_eq!(show["modelfile"], "FROM llama3");
}
