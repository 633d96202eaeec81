//! Subprocess transport speaking newline-delimited JSON-RPC on stdio

use super::{Transport, TransportKind, closed_error};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, ToolgateError};
use crate::protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, ServerMessage,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a closing child gets to exit on its own before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;
type SharedWriter = Arc<Mutex<BufWriter<ChildStdin>>>;

/// A tool server running as a child process
pub struct StdioTransport {
    name: String,
    child: Mutex<Option<Child>>,
    writer: SharedWriter,
    /// Response channels keyed by request id
    pending: PendingMap,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StdioTransport {
    /// Spawn the configured command and start reading its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(name: &str, server: &ServerConfig, client: &ClientConfig) -> Result<Self> {
        let command = server.command.as_deref().ok_or_else(|| {
            ToolgateError::Configuration(format!("Server '{}' has no command", name))
        })?;

        let mut cmd = Command::new(command);
        cmd.args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ToolgateError::Connection(format!("Failed to spawn '{}' for '{}': {}", command, name, e))
        })?;

        let stdin = take_pipe(child.stdin.take(), name, "stdin")?;
        let stdout = take_pipe(child.stdout.take(), name, "stdout")?;
        let stderr = child.stderr.take();

        let transport = Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            writer: Arc::new(Mutex::new(BufWriter::new(stdin))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            request_timeout: client.request_timeout,
        };

        tokio::spawn(read_loop(
            transport.name.clone(),
            BufReader::new(stdout),
            transport.pending.clone(),
            transport.writer.clone(),
            transport.closed.clone(),
            transport.shutdown.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(
                transport.name.clone(),
                stderr,
                transport.shutdown.clone(),
            ));
        }

        debug!(server = %name, command = %command, "Spawned stdio server");
        Ok(transport)
    }

    async fn write_frame<T: Serialize>(&self, message: &T) -> Result<()> {
        if let Err(e) = write_line(&self.writer, message).await {
            self.closed.store(true, Ordering::Release);
            return Err(ToolgateError::Connection(format!(
                "Failed to write to '{}': {}",
                self.name, e
            )));
        }
        Ok(())
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str, which: &str) -> Result<T> {
    pipe.ok_or_else(|| {
        ToolgateError::Connection(format!("Failed to capture {} of '{}'", which, name))
    })
}

async fn write_line<T: Serialize>(writer: &SharedWriter, message: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Dispatch frames from the child's stdout until EOF or shutdown.
async fn read_loop(
    name: String,
    reader: BufReader<ChildStdout>,
    pending: PendingMap,
    writer: SharedWriter,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match ServerMessage::from_line(trimmed) {
                    Ok(ServerMessage::Response(response)) => {
                        let RequestId::Number(id) = &response.id else {
                            warn!(server = %name, id = ?response.id, "Response with foreign id");
                            continue;
                        };
                        let waiter = pending.lock().await.remove(id);
                        if let Some(tx) = waiter {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(ServerMessage::Request(request)) => {
                        let reply = answer_server_request(&request);
                        if let Err(e) = write_line(&writer, &reply).await {
                            warn!(server = %name, error = %e, "Failed to answer server request");
                        }
                    }
                    Ok(ServerMessage::Notification(notification)) => {
                        log_notification(&name, &notification);
                    }
                    Err(e) => {
                        warn!(server = %name, error = %e, frame = %trimmed, "Unparseable frame");
                    }
                }
            }
            Ok(None) => {
                info!(server = %name, "Server closed its output");
                break;
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Read error");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    // dropping the senders wakes every waiter with a closed error
    pending.lock().await.clear();
}

/// We expose no client-side features beyond answering pings.
fn answer_server_request(request: &JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "ping" => JsonRpcResponse::success(request.id.clone(), serde_json::json!({})),
        _ => JsonRpcResponse::error(request.id.clone(), JsonRpcError::method_not_found()),
    }
}

fn log_notification(name: &str, notification: &JsonRpcNotification) {
    match notification.method.as_str() {
        "notifications/message" => {
            let params = notification.params.clone().unwrap_or(Value::Null);
            let level = params["level"].as_str().unwrap_or("info");
            info!(server = %name, level = %level, data = %params["data"], "Server log");
        }
        method => debug!(server = %name, method = %method, "Server notification"),
    }
}

async fn drain_stderr(name: String, stderr: ChildStderr, shutdown: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(server = %name, "stderr: {}", line),
                _ => break,
            },
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method).with_params(params);

        let (tx, rx) = oneshot::channel();
        {
            // the reader marks the transport closed before it clears the
            // map, so checking under the lock cannot miss that clear
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(closed_error(&self.name));
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.write_frame(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(closed_error(&self.name)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolgateError::Timeout(format!("{} on '{}'", method, self.name)))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        let notification = JsonRpcNotification::new(method).with_params(params);
        self.write_frame(&notification).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let mut child = self.child.lock().await;
        if let Some(mut running) = child.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, running.wait()).await.is_err() {
                warn!(server = %self.name, "Server did not exit in time; killing it");
                let _ = running.kill().await;
            }
        }

        self.closed.store(true, Ordering::Release);
        self.pending.lock().await.clear();
        debug!(server = %self.name, "Closed stdio transport");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}
