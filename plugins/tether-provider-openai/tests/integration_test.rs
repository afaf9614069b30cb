use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tether_core::provider::{ChatBackend, ProviderRouter};
use tether_core::types::{Message, SamplingConfig, ToolCall, ToolDefinition, ToolResult};
use tether_provider_openai::OpenAiCompatibleBackend;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn text_body(text: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": text
            },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 5,
            "total_tokens": 15
        }
    })
}

fn tool_body(tool_id: &str, tool_name: &str, args_json: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": tool_id,
                    "type": "function",
                    "function": {
                        "name": tool_name,
                        "arguments": args_json
                    }
                }]
            },
            "finish_reason": "tool_calls"
        }]
    })
}

fn backend(server: &MockServer) -> OpenAiCompatibleBackend {
    OpenAiCompatibleBackend::new(&server.uri(), Some(Duration::from_secs(5))).unwrap()
}

fn conversation() -> Vec<Message> {
    let mut args = Map::new();
    args.insert("path".into(), json!("notes.txt"));
    vec![
        Message::system("be brief", 0),
        Message::user("read notes", 0),
        Message::assistant("", vec![ToolCall::new("call_01", "read_file", args)], 0),
        Message::tool(
            ToolResult {
                call_id: "call_01".into(),
                name: "read_file".into(),
                output: "buy milk".into(),
                is_error: false,
            },
            0,
        ),
    ]
}

#[tokio::test]
async fn test_text_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "qwen", "max_tokens": 4096, "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_body("Hello from llama!")))
        .expect(1)
        .mount(&server)
        .await;

    let result = backend(&server)
        .generate_chat(&[Message::user("Hi", 0)], &[], &SamplingConfig::default(), "qwen.gguf", true)
        .await
        .unwrap();

    assert_eq!(result.content, "Hello from llama!");
    assert!(result.tool_calls.is_empty());
    let usage = result.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 10);
    assert_eq!(usage.completion_tokens, 5);
    assert_eq!(usage.total_tokens, 15);
}

#[tokio::test]
async fn test_tool_call_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{"type": "function", "function": {"name": "list_files"}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_body(
            "call_01",
            "list_files",
            r#"{"path":"src"}"#,
        )))
        .mount(&server)
        .await;

    let tools = vec![ToolDefinition {
        name: "list_files".to_string(),
        description: "List a directory".to_string(),
        parameters: json!({"type": "object", "properties": {}}),
    }];

    let result = backend(&server)
        .generate_chat(&[Message::user("what's in src", 0)], &tools, &SamplingConfig::default(), "m", true)
        .await
        .unwrap();

    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].id, "call_01");
    assert_eq!(result.tool_calls[0].name, "list_files");
    assert_eq!(result.tool_calls[0].arguments["path"], "src");
}

#[tokio::test]
async fn test_tool_results_use_tool_role() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "read notes"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_01",
                    "function": {"name": "read_file", "arguments": "{\"path\":\"notes.txt\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_01", "content": "buy milk"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_body("milk")))
        .expect(1)
        .mount(&server)
        .await;

    let result = backend(&server)
        .generate_chat(&conversation(), &[], &SamplingConfig::default(), "m", true)
        .await
        .unwrap();
    assert_eq!(result.content, "milk");
}

#[tokio::test]
async fn test_tool_results_as_user_text_without_tool_role() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system"},
                {"role": "user"},
                {"role": "assistant"},
                {"role": "user", "content": "Tool: read_file\n\nResult:\nbuy milk"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_body("milk")))
        .expect(1)
        .mount(&server)
        .await;

    let result = backend(&server)
        .generate_chat(&conversation(), &[], &SamplingConfig::default(), "m", false)
        .await
        .unwrap();
    assert_eq!(result.content, "milk");
}

#[tokio::test]
async fn test_http_error_returns_err() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("model is loading"))
        .mount(&server)
        .await;

    let result = backend(&server)
        .generate_chat(&[Message::user("Hi", 0)], &[], &SamplingConfig::default(), "m", true)
        .await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("503"), "expected 503 in error: {err}");
    assert!(err.contains("model is loading"), "expected body in error: {err}");
    assert!(err.contains("request_id=req_"), "expected request id in error: {err}");
}

#[tokio::test]
async fn test_tokenize_counts_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tokenize"))
        .and(body_partial_json(json!({"content": "hello world"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tokens": [1, 2, 3]})))
        .mount(&server)
        .await;

    let count = backend(&server).count_tokens("hello world").await.unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_tokenize_count_field() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tokenize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 7})))
        .mount(&server)
        .await;

    assert_eq!(backend(&server).count_tokens("anything").await.unwrap(), 7);
}

#[tokio::test]
async fn test_router_falls_back_when_tokenize_missing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/tokenize"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = backend(&server);
    assert!(backend.count_tokens("abcdefgh").await.is_err());

    let router = ProviderRouter::new(Arc::new(backend), 1);
    assert_eq!(router.count_tokens("abcdefgh").await, 2);
}
