//! In-process tool servers
//!
//! A [`MemoryServer`] answers the handful of methods the client uses
//! (`initialize`, `tools/list`, `tools/call`, `resources/list`,
//! `prompts/list`, `ping`) from scripted data. [`MemoryConnector`] hands
//! out transports to registered servers by name, so the whole client
//! stack can run without subprocesses or sockets.

use super::{Connector, Transport, TransportKind, closed_error};
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, ToolgateError};
use crate::protocol::{
    JsonRpcError, MCP_PROTOCOL_VERSION, McpPrompt, McpResource, McpTool, ToolCallParams,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

/// Computes the raw `tools/call` result for a tool name and its arguments
pub type CallHandler = Arc<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ServerState {
    name: String,
    version: String,
    tools: Mutex<Vec<McpTool>>,
    resources: Mutex<Vec<McpResource>>,
    prompts: Mutex<Vec<McpPrompt>>,
    handler: Mutex<Option<CallHandler>>,
    /// Items per list page, 0 for everything at once
    page_size: AtomicUsize,
    handshakes: AtomicUsize,
    notifications: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Value)>>,
    fail_handshake: AtomicBool,
    crashed: AtomicBool,
}

/// A scripted tool server living in this process
///
/// Clones share state, so a test can keep one handle to inspect calls
/// while the connector hands another to the client.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl std::fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryServer")
            .field("name", &self.state.name)
            .field("tools", &lock(&self.state.tools).len())
            .finish()
    }
}

impl MemoryServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ServerState {
                name: name.into(),
                version: "1.0.0".to_string(),
                tools: Mutex::new(Vec::new()),
                resources: Mutex::new(Vec::new()),
                prompts: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                page_size: AtomicUsize::new(0),
                handshakes: AtomicUsize::new(0),
                notifications: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                fail_handshake: AtomicBool::new(false),
                crashed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_tool(self, tool: McpTool) -> Self {
        lock(&self.state.tools).push(tool);
        self
    }

    pub fn with_resource(self, resource: McpResource) -> Self {
        lock(&self.state.resources).push(resource);
        self
    }

    pub fn with_prompt(self, prompt: McpPrompt) -> Self {
        lock(&self.state.prompts).push(prompt);
        self
    }

    /// Split list answers into pages of `size` items.
    pub fn with_page_size(self, size: usize) -> Self {
        self.state.page_size.store(size, Ordering::Relaxed);
        self
    }

    /// Answer `tools/call` with `handler` instead of the default echo.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        *lock(&self.state.handler) = Some(Arc::new(handler));
        self
    }

    /// Reject every `initialize` request.
    pub fn failing_handshake(self) -> Self {
        self.state.fail_handshake.store(true, Ordering::Relaxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Replace the advertised tool list.
    pub fn set_tools(&self, tools: Vec<McpTool>) {
        *lock(&self.state.tools) = tools;
    }

    /// Simulate the server dying; open transports start failing.
    pub fn crash(&self) {
        self.state.crashed.store(true, Ordering::Release);
    }

    pub fn restart(&self) {
        self.state.crashed.store(false, Ordering::Release);
    }

    pub fn is_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::Acquire)
    }

    pub fn handshake_count(&self) -> usize {
        self.state.handshakes.load(Ordering::Relaxed)
    }

    /// Every `tools/call` received, in order
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.state.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state.calls).len()
    }

    /// Methods of every notification received, in order
    pub fn notifications(&self) -> Vec<String> {
        lock(&self.state.notifications).clone()
    }

    fn handle(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match method {
            "initialize" => self.initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = lock(&self.state.tools).clone();
                self.page("tools", &tools, params.as_ref())
            }
            "resources/list" => {
                let resources = lock(&self.state.resources).clone();
                self.page("resources", &resources, params.as_ref())
            }
            "prompts/list" => {
                let prompts = lock(&self.state.prompts).clone();
                self.page("prompts", &prompts, params.as_ref())
            }
            "tools/call" => self.call(params),
            _ => Err(JsonRpcError::method_not_found().into()),
        }
    }

    fn initialize(&self) -> Result<Value> {
        self.state.handshakes.fetch_add(1, Ordering::Relaxed);
        if self.state.fail_handshake.load(Ordering::Relaxed) {
            return Err(JsonRpcError::internal_error("Handshake rejected").into());
        }

        let mut capabilities = json!({ "tools": {} });
        if !lock(&self.state.resources).is_empty() {
            capabilities["resources"] = json!({});
        }
        if !lock(&self.state.prompts).is_empty() {
            capabilities["prompts"] = json!({});
        }

        Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": capabilities,
            "serverInfo": { "name": self.state.name, "version": self.state.version },
        }))
    }

    fn page<T: Serialize>(&self, key: &str, items: &[T], params: Option<&Value>) -> Result<Value> {
        let start = match params.and_then(|p| p.get("cursor")).and_then(Value::as_str) {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| JsonRpcError::invalid_params(format!("Bad cursor '{}'", cursor)))?,
            None => 0,
        }
        .min(items.len());

        let size = match self.state.page_size.load(Ordering::Relaxed) {
            0 => items.len(),
            size => size,
        };
        let end = (start + size).min(items.len());

        let mut result = serde_json::Map::new();
        result.insert(key.to_string(), serde_json::to_value(&items[start..end])?);
        if end < items.len() {
            result.insert("nextCursor".to_string(), json!(end.to_string()));
        }
        Ok(Value::Object(result))
    }

    fn call(&self, params: Option<Value>) -> Result<Value> {
        let params: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

        lock(&self.state.calls).push((params.name.clone(), params.arguments.clone()));

        let known = lock(&self.state.tools).iter().any(|t| t.name == params.name);
        if !known {
            return Err(
                JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)).into(),
            );
        }

        let handler = lock(&self.state.handler).clone();
        match handler {
            Some(handler) => handler(&params.name, &params.arguments),
            None => Ok(json!({
                "content": [{ "type": "text", "text": format!("{} ok", params.name) }]
            })),
        }
    }
}

/// Transport to a [`MemoryServer`]
#[derive(Debug)]
pub struct MemoryTransport {
    server: MemoryServer,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(server: MemoryServer) -> Self {
        Self {
            server,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(closed_error(self.server.name()));
        }
        // let other tasks interleave the way a real peer would
        tokio::task::yield_now().await;
        self.server.handle(method, params)
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error(self.server.name()));
        }
        lock(&self.server.state.notifications).push(method.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.server.is_crashed()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }
}

/// Connects to registered [`MemoryServer`]s by name
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    servers: Arc<RwLock<HashMap<String, MemoryServer>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server under its own name, replacing any previous one.
    pub fn add_server(&self, server: MemoryServer) -> &Self {
        self.servers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(server.name().to_string(), server);
        self
    }

    pub fn server(&self, name: &str) -> Option<MemoryServer> {
        self.servers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        name: &str,
        _server: &ServerConfig,
        _client: &ClientConfig,
    ) -> Result<Arc<dyn Transport>> {
        let server = self.server(name).ok_or_else(|| {
            ToolgateError::Connection(format!("No in-process server named '{}'", name))
        })?;
        if server.is_crashed() {
            return Err(ToolgateError::Connection(format!(
                "In-process server '{}' is down",
                name
            )));
        }
        debug!(server = %name, "Opened in-process transport");
        Ok(Arc::new(MemoryTransport::new(server)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notes_server() -> MemoryServer {
        MemoryServer::new("notes")
            .with_tool(McpTool::new("read_file", "Read a file"))
            .with_tool(McpTool::new("write_file", "Write a file"))
            .with_tool(McpTool::new("list_directory", "List a directory"))
    }

    #[tokio::test]
    async fn test_initialize_counts_handshakes() {
        let server = notes_server();
        let transport = MemoryTransport::new(server.clone());

        let result = transport.request("initialize", None).await.unwrap();
        assert_eq!(result["serverInfo"]["name"], "notes");
        assert!(result["capabilities"].get("tools").is_some());
        assert!(result["capabilities"].get("prompts").is_none());
        assert_eq!(server.handshake_count(), 1);
    }

    #[tokio::test]
    async fn test_tools_list_pages() {
        let server = notes_server().with_page_size(2);
        let transport = MemoryTransport::new(server);

        let first = transport.request("tools/list", None).await.unwrap();
        assert_eq!(first["tools"].as_array().unwrap().len(), 2);
        assert_eq!(first["nextCursor"], "2");

        let second = transport
            .request("tools/list", Some(json!({ "cursor": "2" })))
            .await
            .unwrap();
        assert_eq!(second["tools"].as_array().unwrap().len(), 1);
        assert!(second.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn test_call_records_and_rejects_unknown_tools() {
        let server = notes_server().with_handler(|_, args| {
            Ok(json!({ "content": [{ "type": "text", "text": args["path"] }] }))
        });
        let transport = MemoryTransport::new(server.clone());

        let result = transport
            .request(
                "tools/call",
                Some(json!({ "name": "read_file", "arguments": { "path": "a.md" } })),
            )
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "a.md");

        let err = transport
            .request("tools/call", Some(json!({ "name": "format_disk" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolgateError::Protocol { code: -32602, .. }));
        assert_eq!(server.call_count(), 2);
    }

    #[tokio::test]
    async fn test_crash_closes_transport() {
        let connector = MemoryConnector::new();
        let server = notes_server();
        connector.add_server(server.clone());

        let transport = connector
            .open("notes", &ServerConfig::memory(), &ClientConfig::default())
            .await
            .unwrap();
        server.crash();
        assert!(transport.is_closed());
        assert!(transport.request("ping", None).await.is_err());
        assert!(connector
            .open("notes", &ServerConfig::memory(), &ClientConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_method_and_server() {
        let transport = MemoryTransport::new(notes_server());
        let err = transport.request("sampling/createMessage", None).await.unwrap_err();
        assert!(matches!(err, ToolgateError::Protocol { code: -32601, .. }));

        let connector = MemoryConnector::new();
        let err = connector
            .open("ghost", &ServerConfig::memory(), &ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ToolgateError::Connection(_)));
    }
}
