/// Provider protocol client
///
/// Runs the startup sequence against one provider (liveness probe,
/// `initialize`, tool discovery) and exposes tool invocation on top of a
/// [`ProviderSession`].
use super::session::ProviderSession;
use super::types::*;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound for the tools/list probe issued right after spawn
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound for `initialize`
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound for tools/list and tools/call
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one tools/call
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCallResult {
    /// Text content items joined by newlines and trimmed
    pub output: String,
    /// Set when the provider flagged the result with `isError`
    pub is_error: bool,
}

/// Client for a single tool provider
pub struct McpClient {
    config: ProviderConfig,
    session: ProviderSession,
    capabilities: Capabilities,
    tools: Vec<ToolDescriptor>,
}

impl McpClient {
    /// Spawn the provider process and run the startup sequence
    pub async fn connect(config: ProviderConfig) -> Result<Self, McpError> {
        config
            .validate_protocol_version()
            .map_err(McpError::Handshake)?;

        let session = ProviderSession::spawn(&config)?;
        Self::connect_with_session(config, session).await
    }

    /// Run the startup sequence over an already attached session.
    ///
    /// On any failure the session is closed before the error is returned.
    pub async fn connect_with_session(
        config: ProviderConfig,
        session: ProviderSession,
    ) -> Result<Self, McpError> {
        match Self::startup(&config, &session).await {
            Ok((capabilities, tools)) => {
                info!(
                    target: "provider_client",
                    provider = %config.name,
                    server_name = capabilities.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
                    tools = tools.len(),
                    "Provider connected and initialized"
                );
                Ok(Self {
                    config,
                    session,
                    capabilities,
                    tools,
                })
            }
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(target: "provider_client", provider = %config.name, error = %close_err, "Teardown after failed startup reported errors");
                }
                Err(e)
            }
        }
    }

    async fn startup(
        config: &ProviderConfig,
        session: &ProviderSession,
    ) -> Result<(Capabilities, Vec<ToolDescriptor>), McpError> {
        probe(config, session).await?;
        let capabilities = handshake(config, session).await?;
        let tools = list_tools(session).await?;
        Ok((capabilities, tools))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Tools discovered at connect time
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    /// Invoke a tool by its provider-native name
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ProviderCallResult, McpError> {
        debug!(target: "provider_client", provider = %self.config.name, tool = %name, "Calling tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .session
            .request(METHOD_TOOLS_CALL, Some(json!(params)), CALL_TIMEOUT)
            .await?;

        let call: CallToolResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Invalid tools/call result: {}", e)))?;

        let output = call
            .content
            .iter()
            .map(ToolContent::render)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        let is_error = call.is_error.unwrap_or(false);

        if is_error {
            debug!(target: "provider_client", provider = %self.config.name, tool = %name, "Tool reported an error result");
        }

        Ok(ProviderCallResult { output, is_error })
    }

    /// Close the session and terminate the provider
    pub async fn disconnect(&self) -> Result<(), McpError> {
        info!(target: "provider_client", provider = %self.config.name, "Disconnecting provider");
        self.session.close().await
    }
}

/// Confirm the process answers at all before handshaking
async fn probe(config: &ProviderConfig, session: &ProviderSession) -> Result<(), McpError> {
    match session
        .request(METHOD_TOOLS_LIST, Some(json!({})), PROBE_TIMEOUT)
        .await
    {
        // Any answer, even an error reply, proves the process is responsive
        Ok(_) | Err(McpError::Server { .. }) => Ok(()),
        Err(McpError::Timeout { .. }) => {
            warn!(target: "provider_client", provider = %config.name, "Provider did not answer the startup probe");
            Err(McpError::StartupTimeout(PROBE_TIMEOUT))
        }
        Err(McpError::Transport(msg)) => Err(McpError::Launch(format!(
            "provider exited during startup: {}",
            msg
        ))),
        Err(e) => Err(e),
    }
}

async fn handshake(
    config: &ProviderConfig,
    session: &ProviderSession,
) -> Result<Capabilities, McpError> {
    let params = InitializeParams {
        protocol_version: config.protocol_version().to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: ClientInfo {
            name: "toolbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    let result = session
        .request(METHOD_INITIALIZE, Some(json!(params)), HANDSHAKE_TIMEOUT)
        .await
        .map_err(|e| McpError::Handshake(e.to_string()))?;

    let capabilities: Capabilities = serde_json::from_value(result)
        .map_err(|e| McpError::Handshake(format!("Invalid initialize result: {}", e)))?;

    session
        .notify(METHOD_INITIALIZED, None)
        .await
        .map_err(|e| McpError::Handshake(e.to_string()))?;

    Ok(capabilities)
}

async fn list_tools(session: &ProviderSession) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut all_tools = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let params = ListToolsParams { cursor };
        let result = session
            .request(METHOD_TOOLS_LIST, Some(json!(params)), CALL_TIMEOUT)
            .await?;

        let page: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Invalid tools/list result: {}", e)))?;

        all_tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }

    debug!(target: "provider_client", provider = %session.name(), count = all_tools.len(), "Listed tools");
    Ok(all_tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Scripted in-memory provider: answers each method with a fixed reply
    fn scripted(
        name: &str,
        reply: impl Fn(&Value) -> Option<Value> + Send + 'static,
    ) -> ProviderSession {
        let (session_out, provider_in) = duplex(64 * 1024);
        let (mut provider_out, session_in) = duplex(64 * 1024);

        tokio::spawn(async move {
            let mut lines = BufReader::new(provider_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                if req.get("id").is_none() {
                    continue;
                }
                if let Some(result) = reply(&req) {
                    let msg = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
                    provider_out
                        .write_all(format!("{}\n", msg).as_bytes())
                        .await
                        .unwrap();
                }
            }
        });

        ProviderSession::from_streams(name, session_in, session_out)
    }

    #[tokio::test]
    async fn test_connect_follows_pagination() {
        let session = scripted("paged", |req| match req["method"].as_str() {
            Some("initialize") => Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "paged", "version": "1.0"}
            })),
            Some("tools/list") => match req["params"]["cursor"].as_str() {
                None => Some(json!({
                    "tools": [{"name": "a", "inputSchema": {"type": "object"}}],
                    "nextCursor": "page2"
                })),
                Some(_) => Some(json!({"tools": [{"name": "b", "description": "second"}]})),
            },
            _ => None,
        });

        let client = McpClient::connect_with_session(ProviderConfig::new("paged", "mem"), session)
            .await
            .unwrap();

        let names: Vec<&str> = client.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            client.capabilities().server_info.as_ref().map(|s| s.name.as_str()),
            Some("paged")
        );
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_tool_joins_and_flags_errors() {
        let session = scripted("caller", |req| match req["method"].as_str() {
            Some("initialize") => Some(json!({})),
            Some("tools/list") => Some(json!({"tools": []})),
            Some("tools/call") => Some(json!({
                "content": [
                    {"type": "text", "text": "  first"},
                    {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                    {"type": "text", "text": "last  "}
                ],
                "isError": true
            })),
            _ => None,
        });

        let client = McpClient::connect_with_session(ProviderConfig::new("caller", "mem"), session)
            .await
            .unwrap();

        let result = client.call_tool("anything", Map::new()).await.unwrap();
        assert_eq!(result.output, "first\n[image content]\nlast");
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_silent_provider_fails_startup_probe() {
        let session = scripted("silent", |_| None);

        let err = McpClient::connect_with_session(ProviderConfig::new("silent", "mem"), session)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::StartupTimeout(d) if d == PROBE_TIMEOUT));
    }
}
