/// Model adapter: function-calling schema, chat requests, reply parsing
pub mod client;
pub mod types;

pub use client::{parse_chat_response, tool_schema, ChatClient, ChatModel, ModelError};
pub use types::{ChatMessage, Conversation, ModelResponse, Role, ToolCallRequest, ToolCallResult};
