/// Provider session
///
/// Owns the byte streams of one tool provider (usually a spawned child
/// process) and exchanges line-delimited JSON-RPC messages over them.
/// Replies are correlated by request id and, on top of that, a session never
/// has more than one request in flight.
use super::types::*;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = DashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Banner some node-based providers print on every start
const DEV_MODE_BANNER: &str = "Running in development mode";

/// Kind of an inbound message, decided before any typed decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries `result` or `error`
    Response,
    /// Carries `method` but no `id`
    Notification { method: String },
    /// Carries `method` and `id`: the provider is asking us something
    IncomingRequest { method: String },
    /// Valid JSON that is none of the above
    Unrecognized,
}

/// Classify a decoded line by its shape
pub fn classify_message(value: &Value) -> MessageKind {
    let has_payload = value.get("result").is_some() || value.get("error").is_some();
    let method = value.get("method").and_then(Value::as_str);
    let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);

    match (has_payload, method) {
        (true, _) => MessageKind::Response,
        (false, Some(m)) if has_id => MessageKind::IncomingRequest {
            method: m.to_string(),
        },
        (false, Some(m)) => MessageKind::Notification {
            method: m.to_string(),
        },
        (false, None) => MessageKind::Unrecognized,
    }
}

/// Live connection to one tool provider
pub struct ProviderSession {
    name: String,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    request_id: AtomicU64,
    pending: Arc<PendingMap>,
    /// Held for the whole send/await cycle of a request
    request_lock: Mutex<()>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ProviderSession {
    /// Spawn the provider process and attach a session to its stdio
    pub fn spawn(config: &ProviderConfig) -> Result<Self, McpError> {
        info!(
            target: "provider_session",
            provider = %config.name,
            command = %config.command,
            args = ?config.args,
            "Spawning tool provider"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref env) = config.env {
            cmd.envs(env);
        }
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            warn!(target: "provider_session", provider = %config.name, error = %e, "Failed to spawn provider");
            McpError::Launch(format!("{}: {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Launch("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Launch("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(config.name.clone(), stderr);
        }

        Ok(Self::attach(config.name.clone(), stdout, stdin, Some(child)))
    }

    /// Attach a session to an arbitrary stream pair
    pub fn from_streams<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach(name.into(), reader, writer, None)
    }

    fn attach<R, W>(name: String, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let handle = spawn_reader(
            name.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&alive),
        );

        Self {
            name,
            writer: Mutex::new(Some(Box::new(writer))),
            child: Mutex::new(child),
            request_id: AtomicU64::new(1),
            pending,
            request_lock: Mutex::new(()),
            reader: std::sync::Mutex::new(Some(handle)),
            alive,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the output stream is still open and the session not closed
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its reply
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        after: Duration,
    ) -> Result<Value, McpError> {
        let _in_flight = self.request_lock.lock().await;

        if !self.is_alive() {
            return Err(McpError::Transport(format!(
                "session '{}' is closed",
                self.name
            )));
        }

        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        trace!(target: "provider_session", provider = %self.name, id, method, "Sending request");

        if let Err(e) = self
            .write_message(&JsonRpcRequest::new(id, method, params))
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        // The reader may have hit EOF between the liveness check and the insert
        if !self.alive.load(Ordering::SeqCst) && self.pending.remove(&id).is_some() {
            return Err(McpError::Transport(format!(
                "provider '{}' closed its output",
                self.name
            )));
        }

        let response = match timeout(after, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(McpError::Transport(format!(
                    "provider '{}' closed its output before answering {}",
                    self.name, method
                )));
            }
            Err(_) => {
                self.pending.remove(&id);
                warn!(
                    target: "provider_session",
                    provider = %self.name,
                    id,
                    method,
                    timeout_ms = after.as_millis() as u64,
                    "Request timed out"
                );
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    after,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::Server {
                code: error.code,
                message: error.message,
            });
        }

        response
            .result
            .ok_or_else(|| McpError::Protocol(format!("Missing result in {} response", method)))
    }

    /// Send a notification (fire and forget)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport(format!("session '{}' is closed", self.name)))?;

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the input stream, terminate the process and wait for it.
    ///
    /// Every step runs even if an earlier one failed; failures are reported
    /// together. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(target: "provider_session", provider = %self.name, "Closing provider session");
        let mut errors = Vec::new();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                errors.push(format!("closing input stream: {}", e));
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(target: "provider_session", provider = %self.name, %status, "Provider already exited");
                }
                Ok(None) => {
                    if let Err(e) = child.start_kill() {
                        errors.push(format!("terminating process: {}", e));
                    }
                    if let Err(e) = child.wait().await {
                        errors.push(format!("waiting for process exit: {}", e));
                    }
                }
                Err(e) => errors.push(format!("querying process status: {}", e)),
            }
        }

        let reader = match self.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reader {
            handle.abort();
        }

        self.alive.store(false, Ordering::SeqCst);
        self.pending.clear();

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(target: "provider_session", provider = %self.name, errors = ?errors, "Provider teardown reported errors");
            Err(McpError::Teardown(errors))
        }
    }
}

/// Background task draining the provider's output stream
fn spawn_reader<R>(
    name: String,
    reader: R,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "provider_session", provider = %name, error = %e, "Failed to read provider output");
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(_) => {
                    trace!(target: "provider_session", provider = %name, line = %trimmed, "Skipping non-protocol line");
                    continue;
                }
            };

            match classify_message(&value) {
                MessageKind::Response => deliver(&name, &pending, value),
                MessageKind::Notification { method } => {
                    let params = value.get("params").map(Value::to_string).unwrap_or_default();
                    if !params.contains(DEV_MODE_BANNER) {
                        debug!(target: "provider_session", provider = %name, method = %method, params = %params, "Provider notification");
                    }
                }
                MessageKind::IncomingRequest { method } => {
                    debug!(target: "provider_session", provider = %name, method = %method, "Ignoring provider-initiated request");
                }
                MessageKind::Unrecognized => {
                    trace!(target: "provider_session", provider = %name, "Skipping unrecognized message");
                }
            }
        }

        alive.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a closed channel
        pending.clear();
        debug!(target: "provider_session", provider = %name, "Provider output closed");
    })
}

fn deliver(name: &str, pending: &PendingMap, value: Value) {
    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            warn!(target: "provider_session", provider = %name, error = %e, "Malformed response");
            return;
        }
    };

    let Some(id) = response.numeric_id() else {
        warn!(target: "provider_session", provider = %name, id = %response.id, "Response without usable id");
        return;
    };

    match pending.remove(&id) {
        Some((_, tx)) => {
            let _ = tx.send(response);
        }
        None => {
            warn!(target: "provider_session", provider = %name, id, "Dropping response for unknown request");
        }
    }
}

fn spawn_stderr_drain<R>(name: String, stderr: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains(DEV_MODE_BANNER) {
                continue;
            }
            debug!(target: "provider_stderr", provider = %name, "{}", line);
        }
    });
}
