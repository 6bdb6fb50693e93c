use serde::{Serialize, Serializer};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Carries one tool result back to the model
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Correlation id (generated when the endpoint omits one)
    pub id: String,
    /// Sanitized tool name
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Function-calling wire shape
    pub fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            }
        })
    }
}

/// Outcome of one dispatched tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    /// Display text
    pub output: String,
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: output.into(),
            error: Some(error.into()),
        }
    }

    /// Text the model sees for this result
    pub fn message_content(&self) -> String {
        match (&self.error, self.output.is_empty()) {
            (Some(err), true) => format!("Error: {}", err),
            (Some(err), false) => format!("Error: {}\n{}", err, self.output),
            (None, _) => self.output.clone(),
        }
    }
}

/// One message of the chat request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_tool_calls"
    )]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn serialize_tool_calls<S: Serializer>(calls: &[ToolCallRequest], s: S) -> Result<S::Ok, S::Error> {
    let wire: Vec<Value> = calls.iter().map(ToolCallRequest::to_wire).collect();
    wire.serialize(s)
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(response: &ModelResponse) -> Self {
        Self {
            role: Role::Assistant,
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(result: &ToolCallResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.message_content(),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.id.clone()),
        }
    }
}

/// The model's reply to one chat request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// History of one `process_message` exchange, excluding the system prompt.
///
/// Only successful turns are recorded, so a retried request is rebuilt from
/// the same history.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn record_user(&mut self, text: &str) {
        self.messages.push(ChatMessage::user(text));
    }

    pub fn record_assistant(&mut self, response: &ModelResponse) {
        self.messages.push(ChatMessage::assistant(response));
    }

    pub fn record_results(&mut self, results: &[ToolCallResult]) {
        self.messages
            .extend(results.iter().map(ChatMessage::tool_result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_message_wire_shape() {
        let response = ModelResponse::with_tool_calls(vec![ToolCallRequest::new(
            "call_0",
            "echo",
            json!({"text": "hi"}),
        )]);
        let wire = serde_json::to_value(ChatMessage::assistant(&response)).unwrap();
        assert_eq!(
            wire,
            json!({
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "id": "call_0",
                    "type": "function",
                    "function": {"name": "echo", "arguments": {"text": "hi"}}
                }]
            })
        );
    }

    #[test]
    fn test_tool_result_message() {
        let ok = serde_json::to_value(ChatMessage::tool_result(&ToolCallResult::ok("c1", "42"))).unwrap();
        assert_eq!(ok, json!({"role": "tool", "content": "42", "tool_call_id": "c1"}));

        let failed = ToolCallResult::failed("c2", "", "symbol not found");
        assert_eq!(failed.message_content(), "Error: symbol not found");
    }

    #[test]
    fn test_conversation_records_in_order() {
        let mut conversation = Conversation::new();
        conversation.record_user("hello");
        conversation.record_assistant(&ModelResponse::text("hi"));
        conversation.record_results(&[ToolCallResult::ok("a", "1"), ToolCallResult::ok("b", "2")]);

        let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]);
    }
}
