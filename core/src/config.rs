use crate::mcp::ProviderConfig;
use crate::retry::RetryPolicy;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to various tools.

When using the database tool:
1. Use exact column names from the schema
2. Write valid SQLite queries
3. Only read data, never modify it";

/// Complete bridge configuration, read from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub llm: LlmConfig,
    /// Tool providers, started in this order
    #[serde(alias = "mcp_servers")]
    pub providers: Vec<ProviderConfig>,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Model endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String, // e.g., http://localhost:11434/api
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    /// Absent means transport defaults only
    pub request_timeout_ms: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("TOOLBRIDGE_LLM_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:11434/api".to_string()),
            model: std::env::var("TOOLBRIDGE_LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "qwen2.5-coder-7b-instruct-128k:q6_k".to_string()),
            api_key: std::env::var("TOOLBRIDGE_LLM_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("test.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Conversation loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// generate/dispatch/continue cycles per message
    pub max_turns: u32,
    pub message_timeout_secs: u64,
    pub retry_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Argument names whose numeric values are sent as strings
    pub stringify_fields: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: 5,
            message_timeout_secs: 300,
            retry_attempts: 3,
            initial_backoff_ms: 1000,
            stringify_fields: vec!["limit".to_string(), "interval".to_string()],
        }
    }
}

impl OrchestratorConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.initial_backoff_ms),
        )
    }
}

impl BridgeConfig {
    /// Read and validate a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "No TOML config found; using defaults/env");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let text = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;

        tracing::info!(
            target: "config",
            path = %path.display(),
            providers = config.providers.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse TOML text over the defaults (no validation)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BridgeError::Config(format!("invalid TOML: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(BridgeError::Config("llm.model is required".into()));
        }
        if self.llm.endpoint.trim().is_empty() {
            return Err(BridgeError::Config("llm.endpoint is required".into()));
        }

        let mut seen = HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.trim().is_empty() {
                return Err(BridgeError::Config(format!("provider #{} has no name", i + 1)));
            }
            if provider.command.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "provider '{}' has no command",
                    provider.name
                )));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            provider
                .validate_protocol_version()
                .map_err(|e| BridgeError::Config(format!("provider '{}': {}", provider.name, e)))?;
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(BridgeError::Config("database.path is required".into()));
        }
        if self.orchestrator.max_turns == 0 {
            return Err(BridgeError::Config("orchestrator.max_turns must be at least 1".into()));
        }
        if self.orchestrator.retry_attempts == 0 {
            return Err(BridgeError::Config(
                "orchestrator.retry_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
