use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use toolbridge_core::config::LlmConfig;
use toolbridge_core::llm::{ChatClient, ChatModel, Conversation, ModelError, ModelResponse, ToolCallResult};
use toolbridge_core::mcp::ToolDescriptor;

/// One-shot HTTP endpoint: answers a single request with a canned reply and
/// hands back the decoded request body
async fn canned_endpoint(status: &'static str, reply: Value) -> (String, Arc<Mutex<Option<(String, Value)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&captured);

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        // Read headers, then exactly content-length bytes of body
        let (head_end, content_length) = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);
                break (pos + 4, len);
            }
        };
        while buf.len() < head_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let body: Value = serde_json::from_slice(&buf[head_end..head_end + content_length]).unwrap();
        *slot.lock().unwrap() = Some((head, body));

        let payload = reply.to_string();
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            payload.len(),
            payload
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    (format!("http://{}/api", addr), captured)
}

fn config(endpoint: String) -> LlmConfig {
    LlmConfig {
        endpoint,
        model: "tiny".into(),
        api_key: Some("sekrit".into()),
        system_prompt: "be brief".into(),
        request_timeout_ms: Some(5_000),
    }
}

#[tokio::test]
async fn test_generate_posts_history_and_tools() {
    let (endpoint, captured) = canned_endpoint(
        "200 OK",
        json!({"message": {"role": "assistant", "content": "",
            "tool_calls": [{"function": {"name": "echo", "arguments": {"text": "hi"}}}]}}),
    )
    .await;

    let client = ChatClient::new(config(endpoint)).unwrap();
    client.set_tools(vec![ToolDescriptor::new(
        "echo",
        "Echo text",
        json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
    )]);

    let mut conversation = Conversation::new();
    conversation.record_user("earlier");
    conversation.record_assistant(&ModelResponse::text("sure"));

    let response = client.generate(&conversation, "say hi").await.unwrap();
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_0");
    // The client never mutates the history
    assert_eq!(conversation.len(), 2);

    let (head, body) = captured.lock().unwrap().take().unwrap();
    assert!(head.starts_with("POST /api/chat"));
    assert!(head.to_lowercase().contains("authorization: bearer sekrit"));

    assert_eq!(body["model"], "tiny");
    assert_eq!(body["stream"], false);
    let roles: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    assert_eq!(body["messages"][3]["content"], "say hi");
    assert_eq!(body["tools"][0]["function"]["name"], "echo");
    assert_eq!(body["tools"][0]["function"]["parameters"]["required"], json!(["text"]));
}

#[tokio::test]
async fn test_continue_sends_tool_messages() {
    let (endpoint, captured) =
        canned_endpoint("200 OK", json!({"message": {"role": "assistant", "content": "done"}})).await;

    let mut cfg = config(endpoint);
    cfg.system_prompt.clear();
    cfg.api_key = None;
    let client = ChatClient::new(cfg).unwrap();

    let results = vec![
        ToolCallResult::ok("c1", "42"),
        ToolCallResult::failed("c2", "", "boom"),
    ];
    let response = client
        .continue_with_results(&Conversation::new(), &results)
        .await
        .unwrap();
    assert_eq!(response, ModelResponse::text("done"));

    let (head, body) = captured.lock().unwrap().take().unwrap();
    assert!(!head.to_lowercase().contains("authorization"));
    // No tools registered, so the key is omitted
    assert!(body.get("tools").is_none());

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "tool");
    assert_eq!(messages[0]["tool_call_id"], "c1");
    assert_eq!(messages[0]["content"], "42");
    assert_eq!(messages[1]["content"], "Error: boom");
}

#[tokio::test]
async fn test_error_status_is_endpoint_error() {
    let (endpoint, _) = canned_endpoint("503 Service Unavailable", json!({"error": "loading"})).await;
    let client = ChatClient::new(config(endpoint)).unwrap();

    let err = client.generate(&Conversation::new(), "hi").await.unwrap_err();
    match err {
        ModelError::Endpoint { status, ref body } => {
            assert_eq!(status, 503);
            assert!(body.contains("loading"));
        }
        ref other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ChatClient::new(config(format!("http://{}/api", addr))).unwrap();
    let err = client.generate(&Conversation::new(), "hi").await.unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
}
