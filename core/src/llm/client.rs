use super::types::{ChatMessage, Conversation, ModelResponse, ToolCallRequest, ToolCallResult};
use crate::config::LlmConfig;
use crate::mcp::ToolDescriptor;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model endpoint returned status {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("Failed to decode model response: {0}")]
    Decode(String),

    #[error("Model request timed out: {0}")]
    Timeout(String),

    #[error("Failed to connect to model endpoint: {0}")]
    Connect(String),

    #[error("Model request failed: {0}")]
    Request(String),
}

impl ModelError {
    /// Network-level conditions worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Timeout(_) | ModelError::Connect(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::Timeout(e.to_string())
        } else if e.is_connect() {
            ModelError::Connect(e.to_string())
        } else if e.is_decode() {
            ModelError::Decode(e.to_string())
        } else {
            ModelError::Request(e.to_string())
        }
    }
}

/// The conversational model as seen by the orchestrator.
///
/// Implementations do not retry; the caller owns retry policy. Neither call
/// mutates the conversation, the caller records successful turns.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Replace the tool set offered on every subsequent request
    fn set_tools(&self, tools: Vec<ToolDescriptor>);

    /// Send the history plus a new user message
    async fn generate(
        &self,
        conversation: &Conversation,
        text: &str,
    ) -> Result<ModelResponse, ModelError>;

    /// Send the history plus one message per tool result
    async fn continue_with_results(
        &self,
        conversation: &Conversation,
        results: &[ToolCallResult],
    ) -> Result<ModelResponse, ModelError>;
}

/// Function-calling schema entry for one tool
pub fn tool_schema(tool: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": {
                "type": "object",
                "properties": tool.properties(),
                "required": tool.required(),
            }
        }
    })
}

/// HTTP chat client for an Ollama-style `/chat` endpoint
pub struct ChatClient {
    http: Client,
    cfg: LlmConfig,
    tools: RwLock<Vec<Value>>,
}

impl ChatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self, ModelError> {
        let mut builder = Client::builder();
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let http = builder
            .build()
            .map_err(|e| ModelError::Request(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            cfg,
            tools: RwLock::new(Vec::new()),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat", self.cfg.endpoint.trim_end_matches('/'))
    }

    fn build_messages(&self, conversation: &Conversation, extra: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(conversation.len() + extra.len() + 1);
        if !self.cfg.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.cfg.system_prompt.clone()));
        }
        messages.extend(conversation.messages().iter().cloned());
        messages.extend(extra);
        messages
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> Result<ModelResponse, ModelError> {
        let tools = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let count = messages.len();
        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        let url = self.chat_url();
        debug!(target: "chat_client", url = %url, messages = count, "POST chat request");

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!(target: "chat_client", %status, body = %text, "Model endpoint error");
            return Err(ModelError::Endpoint {
                status: status.as_u16(),
                body: text,
            });
        }

        let val: Value = resp
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        parse_chat_response(&val)
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        let schemas = tools.iter().map(tool_schema).collect();
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = schemas;
    }

    async fn generate(
        &self,
        conversation: &Conversation,
        text: &str,
    ) -> Result<ModelResponse, ModelError> {
        let messages = self.build_messages(conversation, vec![ChatMessage::user(text)]);
        self.send(messages).await
    }

    async fn continue_with_results(
        &self,
        conversation: &Conversation,
        results: &[ToolCallResult],
    ) -> Result<ModelResponse, ModelError> {
        let extra = results.iter().map(ChatMessage::tool_result).collect();
        let messages = self.build_messages(conversation, extra);
        self.send(messages).await
    }
}

/// Decode `{message: {...}}` or chat-completions `{choices: [{message}]}`
pub fn parse_chat_response(v: &Value) -> Result<ModelResponse, ModelError> {
    let message = v
        .get("message")
        .or_else(|| {
            v.get("choices")
                .and_then(|c| c.as_array())
                .and_then(|arr| arr.first())
                .and_then(|first| first.get("message"))
        })
        .ok_or_else(|| ModelError::Decode("response carries no message".to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    Ok(ModelResponse {
        content,
        tool_calls: parse_tool_calls(message),
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
    let mut calls = Vec::new();
    let Some(tc_arr) = message.get("tool_calls").and_then(|x| x.as_array()) else {
        return calls;
    };

    for (index, tc) in tc_arr.iter().enumerate() {
        let Some(func) = tc.get("function") else {
            continue;
        };
        let name = func
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }

        // Unparseable string arguments stay a string so validation rejects them
        let arguments = match func.get("arguments") {
            Some(Value::String(s)) if s.trim().is_empty() => json!({}),
            Some(Value::String(s)) => {
                serde_json::from_str::<Value>(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            Some(v) => v.clone(),
            None => json!({}),
        };

        let id = tc
            .get("id")
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("call_{}", index));

        calls.push(ToolCallRequest {
            id,
            name,
            arguments,
        });
    }

    calls
}
