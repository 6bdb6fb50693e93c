use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolbridge_core::llm::{
    ChatModel, Conversation, ModelError, ModelResponse, ToolCallRequest, ToolCallResult,
};
use toolbridge_core::mcp::{ProviderConfig, ToolDescriptor};
use toolbridge_core::retry::SleepFn;
use toolbridge_core::tools::{QueryDatabaseTool, Tool, ToolError};
use toolbridge_core::{BridgeError, Orchestrator, OrchestratorOptions};

/// Model double that replays a fixed script and records what it was sent
#[derive(Default)]
struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    tools: Mutex<Vec<String>>,
    /// (history length, results) per continue call
    continues: Mutex<Vec<(usize, Vec<ToolCallResult>)>>,
    generates: Mutex<u32>,
    delay: Option<Duration>,
    repeat_tool_call: Option<ToolCallRequest>,
}

impl ScriptedModel {
    fn new(script: Vec<Result<ModelResponse, ModelError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    fn next(&self) -> Result<ModelResponse, ModelError> {
        if let Some(call) = &self.repeat_tool_call {
            return Ok(ModelResponse::with_tool_calls(vec![call.clone()]));
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ModelResponse::text("")))
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn set_tools(&self, tools: Vec<ToolDescriptor>) {
        *self.tools.lock().unwrap() = tools.into_iter().map(|t| t.name).collect();
    }

    async fn generate(&self, conversation: &Conversation, _text: &str) -> Result<ModelResponse, ModelError> {
        assert!(conversation.is_empty());
        *self.generates.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next()
    }

    async fn continue_with_results(
        &self,
        conversation: &Conversation,
        results: &[ToolCallResult],
    ) -> Result<ModelResponse, ModelError> {
        self.continues
            .lock()
            .unwrap()
            .push((conversation.len(), results.to_vec()));
        self.next()
    }
}

fn call(id: &str, name: &str, arguments: serde_json::Value) -> ModelResponse {
    ModelResponse::with_tool_calls(vec![ToolCallRequest::new(id, name, arguments)])
}

fn echo_config() -> ProviderConfig {
    ProviderConfig::new("echo", env!("CARGO_BIN_EXE_echo_provider"))
}

fn recording_sleeper() -> (SleepFn, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&sleeps);
    let sleeper: SleepFn = Arc::new(move |delay| {
        recorded.lock().unwrap().push(delay);
        Box::pin(async {})
    });
    (sleeper, sleeps)
}

async fn builtin_only(model: Arc<ScriptedModel>) -> Orchestrator {
    let db: Arc<dyn Tool> = Arc::new(QueryDatabaseTool::open_in_memory().unwrap());
    Orchestrator::with_clients(model, Vec::new(), vec![db], OrchestratorOptions::default()).await
}

#[tokio::test]
async fn test_echo_round_trip_through_provider() {
    let model = ScriptedModel::new(vec![
        Ok(call("c1", "echo", json!({"text": "hi"}))),
        Ok(ModelResponse::text("")),
    ]);

    let orch = Orchestrator::start_with(
        model.clone(),
        &[echo_config()],
        Vec::new(),
        OrchestratorOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(*model.tools.lock().unwrap(), vec!["echo", "fetch_price", "fail"]);

    // Empty final reply falls back to the last tool output
    let reply = orch.process_message("say hi").await.unwrap();
    assert_eq!(reply, "hi");

    let continues = model.continues.lock().unwrap().clone();
    assert_eq!(continues.len(), 1);
    // user + assistant tool-call message
    assert_eq!(continues[0].0, 2);
    assert_eq!(continues[0].1, vec![ToolCallResult::ok("c1", "hi")]);

    let stats = orch.stats();
    assert_eq!(stats.provider_calls, 1);
    assert_eq!(stats.tool_calls, 1);
    assert_eq!(stats.tool_errors, 0);

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stringified_limit_reaches_provider() {
    let model = ScriptedModel::new(vec![
        Ok(call("c1", "fetch_price", json!({"symbol": "BTC", "limit": 5}))),
        Ok(ModelResponse::text("BTC is at 42000")),
    ]);
    let orch = Orchestrator::start_with(model.clone(), &[echo_config()], Vec::new(), OrchestratorOptions::default())
        .await
        .unwrap();

    let reply = orch.process_message("price?").await.unwrap();
    assert_eq!(reply, "BTC is at 42000");

    let continues = model.continues.lock().unwrap().clone();
    assert_eq!(
        continues[0].1[0].output,
        "LIMIT  PRICE  SYMBOL\n-----  -----  ------\n5      42000  BTC"
    );

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_provider_error_result_is_fed_back() {
    let model = ScriptedModel::new(vec![
        Ok(call("c1", "fail", json!({}))),
        Ok(ModelResponse::text("the upstream is down")),
    ]);
    let orch = Orchestrator::start_with(model.clone(), &[echo_config()], Vec::new(), OrchestratorOptions::default())
        .await
        .unwrap();

    let reply = orch.process_message("try it").await.unwrap();
    assert_eq!(reply, "the upstream is down");

    let result = model.continues.lock().unwrap()[0].1[0].clone();
    assert_eq!(result.output, "upstream unavailable");
    assert!(result.error.is_some());
    assert!(result.message_content().starts_with("Error: "));

    orch.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_tool_aborts_without_provider_call() {
    let model = ScriptedModel::new(vec![Ok(call("c1", "launch_rockets", json!({})))]);
    let orch = builtin_only(model.clone()).await;

    let err = orch.process_message("go").await.unwrap_err();
    assert!(matches!(err, BridgeError::Tool(ToolError::NotFound(ref name)) if name == "launch_rockets"));
    assert!(model.continues.lock().unwrap().is_empty());

    let stats = orch.stats();
    assert_eq!(stats.provider_calls, 0);
    assert_eq!(stats.tool_errors, 1);
}

#[tokio::test]
async fn test_tool_of_disconnected_provider_fails_fast() {
    let model = ScriptedModel::new(Vec::new());
    let orch = builtin_only(model).await;
    orch.registry().register_provider_tools(
        "ghost",
        &[ToolDescriptor::new("lookup", "Look something up", json!({"type": "object"}))],
    );

    let err = orch
        .dispatch(&ToolCallRequest::new("c1", "lookup", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Tool(ToolError::UnknownProvider { ref provider, ref tool })
            if provider == "ghost" && tool == "lookup"
    ));

    let stats = orch.stats();
    assert_eq!(stats.provider_calls, 0);
    assert_eq!(stats.tool_errors, 1);
}

#[tokio::test]
async fn test_builtin_query_tool() {
    let model = ScriptedModel::new(vec![
        Ok(call("q1", "query_database", json!({"query": "SELECT 1"}))),
        Ok(ModelResponse::text("<|im_start|>one<|im_end|>")),
    ]);
    let orch = builtin_only(model.clone()).await;
    assert_eq!(orch.tool_names(), vec!["query_database"]);

    let reply = orch.process_message("count").await.unwrap();
    assert_eq!(reply, "one");

    let continues = model.continues.lock().unwrap().clone();
    assert_eq!(continues[0].1, vec![ToolCallResult::ok("q1", "1\n-\n1")]);
}

#[tokio::test]
async fn test_write_query_aborts_turn() {
    let model = ScriptedModel::new(vec![Ok(call("q1", "query_database", json!({"query": "DROP TABLE t"})))]);
    let orch = builtin_only(model).await;

    let err = orch.process_message("drop it").await.unwrap_err();
    assert!(matches!(err, BridgeError::Tool(ToolError::PermissionDenied(_))));
}

#[tokio::test]
async fn test_missing_required_argument_is_rejected() {
    let model = ScriptedModel::new(vec![Ok(call("q1", "query_database", json!({})))]);
    let orch = builtin_only(model).await;

    let err = orch.process_message("query").await.unwrap_err();
    assert!(matches!(err, BridgeError::Tool(ToolError::InvalidArguments { .. })));
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let model = ScriptedModel::new(vec![
        Err(ModelError::Connect("refused".into())),
        Err(ModelError::Timeout("slow".into())),
        Ok(ModelResponse::text("ok")),
    ]);
    let (sleeper, sleeps) = recording_sleeper();
    let orch = builtin_only(model.clone()).await.with_sleeper(sleeper);

    assert_eq!(orch.process_message("hello").await.unwrap(), "ok");
    assert_eq!(
        *sleeps.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(*model.generates.lock().unwrap(), 3);

    let stats = orch.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.model_calls, 3);
}

#[tokio::test]
async fn test_non_transient_failure_is_not_retried() {
    let model = ScriptedModel::new(vec![Err(ModelError::Endpoint {
        status: 400,
        body: "bad request".into(),
    })]);
    let (sleeper, sleeps) = recording_sleeper();
    let orch = builtin_only(model.clone()).await.with_sleeper(sleeper);

    let err = orch.process_message("hello").await.unwrap_err();
    assert!(matches!(err, BridgeError::Model(ModelError::Endpoint { status: 400, .. })));
    assert!(sleeps.lock().unwrap().is_empty());
    assert_eq!(*model.generates.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let model = ScriptedModel::new(vec![
        Err(ModelError::Timeout("1".into())),
        Err(ModelError::Timeout("2".into())),
        Err(ModelError::Timeout("3".into())),
    ]);
    let (sleeper, _) = recording_sleeper();
    let orch = builtin_only(model).await.with_sleeper(sleeper);

    let err = orch.process_message("hello").await.unwrap_err();
    assert!(matches!(err, BridgeError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_turn_limit_stops_the_loop() {
    let model = Arc::new(ScriptedModel {
        repeat_tool_call: Some(ToolCallRequest::new("q", "query_database", json!({"query": "SELECT 7 AS n"}))),
        ..Default::default()
    });
    let db: Arc<dyn Tool> = Arc::new(QueryDatabaseTool::open_in_memory().unwrap());
    let options = OrchestratorOptions {
        max_turns: 2,
        ..OrchestratorOptions::default()
    };
    let orch = Orchestrator::with_clients(model.clone(), Vec::new(), vec![db], options).await;

    let reply = orch.process_message("loop").await.unwrap();
    assert_eq!(reply, "N\n-\n7");
    assert_eq!(model.continues.lock().unwrap().len(), 2);
    assert_eq!(orch.stats().tool_calls, 2);
}

#[tokio::test]
async fn test_message_deadline() {
    let model = Arc::new(ScriptedModel {
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let options = OrchestratorOptions {
        message_timeout: Duration::from_millis(50),
        ..OrchestratorOptions::default()
    };
    let orch = Orchestrator::with_clients(model, Vec::new(), Vec::new(), options).await;

    let err = orch.process_message("slow").await.unwrap_err();
    assert!(matches!(err, BridgeError::DeadlineExceeded(d) if d == Duration::from_millis(50)));
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_cancels() {
    let model = ScriptedModel::new(Vec::new());
    let orch = Orchestrator::start_with(model, &[echo_config()], Vec::new(), OrchestratorOptions::default())
        .await
        .unwrap();

    orch.shutdown().await.unwrap();
    orch.shutdown().await.unwrap();

    let err = orch.process_message("anyone there?").await.unwrap_err();
    assert!(matches!(err, BridgeError::Cancelled));
}

#[tokio::test]
async fn test_startup_failure_names_provider() {
    let model = ScriptedModel::new(Vec::new());
    let providers = [
        echo_config(),
        ProviderConfig::new("ghost", "/nonexistent/toolbridge-provider"),
    ];
    let err = Orchestrator::start_with(model, &providers, Vec::new(), OrchestratorOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Provider { ref provider, .. } if provider == "ghost"));
}
