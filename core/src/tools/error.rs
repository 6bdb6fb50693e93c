use crate::mcp::McpError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Unknown provider '{provider}' for tool '{tool}'")]
    UnknownProvider { provider: String, tool: String },

    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Provider '{provider}' call failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: McpError,
    },
}

impl ToolError {
    pub fn invalid(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
