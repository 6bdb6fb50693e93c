use super::error::ToolResult;
use async_trait::async_trait;
use serde_json::Value;

/// A tool executed inside this process (the built-in path)
#[async_trait]
pub trait Tool: Send + Sync {
    /// The model-facing tool name (e.g., "query_database")
    fn name(&self) -> String;

    /// A human-readable description of what the tool does
    fn description(&self) -> String;

    /// The JSON Schema for the tool's arguments
    fn parameters(&self) -> Value;

    /// Execute the tool with already validated arguments
    async fn call(&self, arguments: Value) -> ToolResult<Value>;
}
