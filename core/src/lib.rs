// Toolbridge Core Library
// Tool provider protocol client, tool registry and model dispatch orchestrator

pub mod config;
pub mod llm;
pub mod mcp;
pub mod orchestrator;
pub mod retry;
pub mod telemetry;
pub mod tools;

// Export core types
pub use config::BridgeConfig;
pub use orchestrator::{Orchestrator, OrchestratorOptions, OrchestratorStats};

// Error types
use crate::llm::ModelError;
use crate::mcp::McpError;
use crate::tools::ToolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: McpError,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Model request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: ModelError,
    },

    #[error("Message processing exceeded {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Shutdown failed: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
