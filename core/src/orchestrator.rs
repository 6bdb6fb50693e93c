/// Orchestrator
///
/// Starts every provider, builds the tool registry, and drives the
/// generate -> dispatch -> continue loop for each user message.
use crate::config::{BridgeConfig, OrchestratorConfig};
use crate::llm::{ChatClient, ChatModel, Conversation, ModelError, ModelResponse, ToolCallRequest, ToolCallResult};
use crate::mcp::{McpClient, McpError, ProviderConfig, ProviderManager};
use crate::retry::{execute_with_retry, tokio_sleeper, RetryFailure, RetryPolicy, SleepFn};
use crate::tools::format::{clean_model_output, format_provider_output, format_result};
use crate::tools::validation::{coerce_arguments, validate_arguments};
use crate::tools::{QueryDatabaseTool, Tool, ToolError, ToolRegistry, ToolTarget};
use crate::{BridgeError, Result};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// generate/dispatch/continue cycles per message
    pub max_turns: u32,
    pub message_timeout: Duration,
    pub retry: RetryPolicy,
    pub stringify_fields: Vec<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorOptions {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_turns: cfg.max_turns.max(1),
            message_timeout: cfg.message_timeout(),
            retry: cfg.retry_policy(),
            stringify_fields: cfg.stringify_fields.clone(),
        }
    }
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorStats {
    pub messages: u64,
    pub model_calls: u64,
    pub retries: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub provider_calls: u64,
    pub avg_tool_latency_ms: f64,
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    providers: ProviderManager,
    registry: ToolRegistry,
    options: OrchestratorOptions,
    sleeper: SleepFn,
    cancel: CancellationToken,
    stats: Mutex<OrchestratorStats>,
    shut_down: AtomicBool,
}

impl Orchestrator {
    /// Build everything from configuration: model client, query database,
    /// and every configured provider
    pub async fn start(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;

        let model = Arc::new(ChatClient::new(config.llm.clone())?);
        let database = QueryDatabaseTool::open(&config.database.path)?;
        let builtins: Vec<Arc<dyn Tool>> = vec![Arc::new(database)];

        Self::start_with(
            model,
            &config.providers,
            builtins,
            OrchestratorOptions::from(&config.orchestrator),
        )
        .await
    }

    /// Spawn the given providers; the first failure aborts startup
    pub async fn start_with(
        model: Arc<dyn ChatModel>,
        providers: &[ProviderConfig],
        builtins: Vec<Arc<dyn Tool>>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let manager = ProviderManager::new();
        let connected = manager.connect_all(providers).await?;
        Ok(Self::assemble(model, manager, connected, builtins, options))
    }

    /// Use providers that are already connected (in registration order)
    pub async fn with_clients(
        model: Arc<dyn ChatModel>,
        clients: Vec<McpClient>,
        builtins: Vec<Arc<dyn Tool>>,
        options: OrchestratorOptions,
    ) -> Self {
        let manager = ProviderManager::new();
        let mut connected = Vec::with_capacity(clients.len());
        for client in clients {
            connected.push(manager.insert(client).await);
        }
        Self::assemble(model, manager, connected, builtins, options)
    }

    fn assemble(
        model: Arc<dyn ChatModel>,
        providers: ProviderManager,
        connected: Vec<Arc<McpClient>>,
        builtins: Vec<Arc<dyn Tool>>,
        options: OrchestratorOptions,
    ) -> Self {
        let registry = ToolRegistry::new();
        for tool in builtins {
            registry.register_builtin(tool);
        }
        for client in &connected {
            registry.register_provider_tools(client.name(), client.tools());
        }

        model.set_tools(registry.descriptors());

        info!(
            target: "orchestrator",
            providers = connected.len(),
            tools = registry.len(),
            "Orchestrator ready"
        );

        Self {
            model,
            providers,
            registry,
            options,
            sleeper: tokio_sleeper(),
            cancel: CancellationToken::new(),
            stats: Mutex::new(OrchestratorStats::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Replace the backoff sleep
    pub fn with_sleeper(mut self, sleeper: SleepFn) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Sanitized names of every registered tool
    pub fn tool_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut OrchestratorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Answer one user message.
    ///
    /// Bounded by the per-message timeout and cancelled by `shutdown`.
    #[tracing::instrument(name = "orchestrator.process_message", skip(self, text), fields(len = text.len(), turns = tracing::field::Empty))]
    pub async fn process_message(&self, text: &str) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        self.update_stats(|s| s.messages += 1);

        let deadline = self.options.message_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BridgeError::Cancelled),
            outcome = timeout(deadline, self.converse(text)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(target: "orchestrator", timeout_secs = deadline.as_secs(), "Message processing deadline exceeded");
                    Err(BridgeError::DeadlineExceeded(deadline))
                }
            },
        }
    }

    async fn converse(&self, text: &str) -> Result<String> {
        let mut conversation = Conversation::new();

        let mut response = {
            let (model, conv) = (&self.model, &conversation);
            self.call_model("generate", move || model.generate(conv, text))
                .await?
        };
        conversation.record_user(text);

        let mut last_output: Option<String> = None;
        let mut turns = 0;

        while response.has_tool_calls() && turns < self.options.max_turns {
            turns += 1;
            debug!(target: "orchestrator", turn = turns, calls = response.tool_calls.len(), "Dispatching tool calls");

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let result = self.dispatch(call).await?;
                if !result.output.is_empty() {
                    last_output = Some(result.output.clone());
                }
                results.push(result);
            }

            conversation.record_assistant(&response);
            response = {
                let (model, conv, res) = (&self.model, &conversation, results.as_slice());
                self.call_model("continue", move || model.continue_with_results(conv, res))
                    .await?
            };
            conversation.record_results(&results);
        }

        Span::current().record("turns", turns);

        if response.has_tool_calls() {
            warn!(target: "orchestrator", max_turns = self.options.max_turns, "Turn limit reached with tool calls pending");
        }

        let content = clean_model_output(&response.content);
        if !content.is_empty() {
            return Ok(content);
        }

        match last_output {
            Some(output) => {
                debug!(target: "orchestrator", "Model reply empty, using last tool output");
                Ok(output)
            }
            None => {
                warn!(target: "orchestrator", "Model returned no content");
                Ok(String::new())
            }
        }
    }

    /// One model request under the retry policy
    async fn call_model<F, Fut>(&self, operation: &str, mut call: F) -> Result<ModelResponse>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<ModelResponse, ModelError>>,
    {
        let outcome = execute_with_retry(
            operation,
            &self.options.retry,
            &self.sleeper,
            |_, _, _| self.update_stats(|s| s.retries += 1),
            |_attempt| {
                self.update_stats(|s| s.model_calls += 1);
                call()
            },
        )
        .await;

        outcome.map_err(|RetryFailure { attempts, error, exhausted }| {
            warn!(target: "orchestrator", operation, attempts, error = %error, "Model call failed");
            if exhausted {
                BridgeError::RetriesExhausted {
                    attempts,
                    source: error,
                }
            } else {
                BridgeError::Model(error)
            }
        })
    }

    /// Route one tool call to its owner and format the result
    pub async fn dispatch(&self, call: &ToolCallRequest) -> Result<ToolCallResult> {
        let started = Instant::now();
        let outcome = self.dispatch_inner(call).await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;

        self.update_stats(|s| {
            s.tool_calls += 1;
            if outcome.is_err() {
                s.tool_errors += 1;
            }
            let n = s.tool_calls as f64;
            s.avg_tool_latency_ms = ((s.avg_tool_latency_ms * (n - 1.0)) + elapsed) / n;
        });

        match &outcome {
            Ok(result) => {
                info!(target: "orchestrator", tool = %call.name, id = %call.id, failed = result.error.is_some(), latency_ms = elapsed, "Tool call finished")
            }
            Err(e) => {
                warn!(target: "orchestrator", tool = %call.name, id = %call.id, error = %e, latency_ms = elapsed, "Tool call failed")
            }
        }

        outcome.map_err(BridgeError::Tool)
    }

    async fn dispatch_inner(&self, call: &ToolCallRequest) -> std::result::Result<ToolCallResult, ToolError> {
        let entry = self.registry.resolve(&call.name)?;

        let arguments = coerce_arguments(
            &entry.descriptor,
            call.arguments.clone(),
            &self.options.stringify_fields,
        );
        let arguments = validate_arguments(&entry.descriptor, arguments)?;

        match &entry.target {
            ToolTarget::BuiltIn(tool) => {
                let value = tool.call(Value::Object(arguments)).await?;
                Ok(ToolCallResult::ok(&call.id, format_result(&value)))
            }
            ToolTarget::Provider {
                provider,
                native_name,
            } => {
                let client = self.providers.get(provider).await.ok_or_else(|| {
                    ToolError::UnknownProvider {
                        provider: provider.clone(),
                        tool: call.name.clone(),
                    }
                })?;

                self.update_stats(|s| s.provider_calls += 1);
                let outcome = client
                    .call_tool(native_name, arguments)
                    .await
                    .map_err(|source| ToolError::Provider {
                        provider: provider.clone(),
                        source,
                    })?;

                let output = format_provider_output(&outcome.output);
                if outcome.is_error {
                    Ok(ToolCallResult::failed(
                        &call.id,
                        output,
                        format!("{} reported an error", native_name),
                    ))
                } else {
                    Ok(ToolCallResult::ok(&call.id, output))
                }
            }
        }
    }

    /// Cancel in-flight work and tear down every provider.
    ///
    /// All teardown failures are reported together; calling again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(target: "orchestrator", "Shutting down orchestrator");
        self.cancel.cancel();

        match self.providers.shutdown().await {
            Ok(()) => Ok(()),
            Err(McpError::Teardown(errors)) => Err(BridgeError::Shutdown(errors)),
            Err(other) => Err(BridgeError::Shutdown(vec![other.to_string()])),
        }
    }
}
