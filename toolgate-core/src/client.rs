//! Connection management for tool servers
//!
//! [`ClientManager`] owns one [`ServerConnection`] per configured server.
//! Connecting opens a transport through the [`Connector`], runs the
//! `initialize` handshake and discovers tools, resources and prompts. Every
//! tool call goes through here so its latency and failures reach the
//! [`PerformanceMonitor`].
//!
//! State per connection:
//!
//! ```text
//! connecting ──> connected ──> disconnected
//!      │             │
//!      └─(dropped)   └──> error (transport closed under us)
//! ```
//!
//! Locks are never held while talking to a transport or running hooks.

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, ToolgateError};
use crate::events::{ClientEvent, ClientEventHook, HookRegistry};
use crate::monitor::{PerformanceMonitor, PerformanceSummary};
use crate::protocol::{
    INITIALIZED_NOTIFICATION, InitializeParams, InitializeResult, McpPrompt, McpResource, McpTool,
    ServerCapabilities, ServerInfo,
};
use crate::transport::{Connector, DefaultConnector, Transport, TransportKind};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// What a server offered during discovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredCapabilities {
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub prompts: Vec<McpPrompt>,
}

/// One server as seen by the client manager
#[derive(Clone)]
pub struct ServerConnection {
    pub name: String,
    pub transport_kind: TransportKind,
    pub state: ConnectionState,
    pub capabilities: DiscoveredCapabilities,
    pub server_info: ServerInfo,
    pub connected_at: Option<DateTime<Utc>>,
    /// Absent while the handshake is in flight
    transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("transport_kind", &self.transport_kind)
            .field("state", &self.state)
            .field("tools", &self.capabilities.tools.len())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl ServerConnection {
    fn connecting(name: &str, transport_kind: TransportKind) -> Self {
        Self {
            name: name.to_string(),
            transport_kind,
            state: ConnectionState::Connecting,
            capabilities: DiscoveredCapabilities::default(),
            server_info: ServerInfo::default(),
            connected_at: None,
            transport: None,
        }
    }
}

/// Result of a successful handshake plus discovery
struct Established {
    transport: Arc<dyn Transport>,
    init: InitializeResult,
    capabilities: DiscoveredCapabilities,
}

/// Owns connections to tool servers and performs raw protocol calls
pub struct ClientManager {
    connections: RwLock<HashMap<String, ServerConnection>>,
    connector: Arc<dyn Connector>,
    monitor: PerformanceMonitor,
    hooks: HookRegistry,
    config: ClientConfig,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("client_name", &self.config.client_name)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ClientManager {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        monitor: PerformanceMonitor,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connector,
            monitor,
            hooks: HookRegistry::new(),
            config,
        }
    }

    /// A manager that opens stdio and http transports
    pub fn with_default_connector(config: ClientConfig, monitor: PerformanceMonitor) -> Self {
        Self::new(config, Arc::new(DefaultConnector), monitor)
    }

    /// Observe connection and call events.
    pub fn add_hook(&self, hook: Arc<dyn ClientEventHook>) {
        self.hooks.register(hook);
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Connect to a server and discover what it offers.
    ///
    /// Connecting an already connected server returns the capabilities
    /// found the first time without a new handshake.
    pub async fn connect(&self, name: &str, server: &ServerConfig) -> Result<DiscoveredCapabilities> {
        {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(name) {
                match existing.state {
                    ConnectionState::Connected => {
                        debug!(server = %name, "Already connected");
                        return Ok(existing.capabilities.clone());
                    }
                    ConnectionState::Connecting => {
                        return Err(ToolgateError::Connection(format!(
                            "Server '{}' is already connecting",
                            name
                        )));
                    }
                    // stale entries are replaced by the new attempt
                    ConnectionState::Disconnected | ConnectionState::Error => {}
                }
            }
            connections.insert(
                name.to_string(),
                ServerConnection::connecting(name, server.transport),
            );
        }

        info!(server = %name, transport = %server.transport, "Connecting");
        let started = Instant::now();

        let established = match self.establish(name, server).await {
            Ok(established) => established,
            Err(e) => {
                self.connections.write().await.remove(name);
                self.fail_connect(name, &e).await;
                return Err(e);
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let Established {
            transport,
            init,
            capabilities,
        } = established;

        let installed = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(name) {
                Some(entry) if entry.state == ConnectionState::Connecting => {
                    entry.state = ConnectionState::Connected;
                    entry.capabilities = capabilities.clone();
                    entry.server_info = init.server_info.clone();
                    entry.connected_at = Some(Utc::now());
                    entry.transport = Some(transport.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            // disconnected while the handshake was running
            let _ = transport.close().await;
            return Err(ToolgateError::Connection(format!(
                "Server '{}' was disconnected while connecting",
                name
            )));
        }

        self.monitor.record_connection_time(name, elapsed_ms).await;
        info!(
            server = %name,
            server_name = %init.server_info.name,
            server_version = %init.server_info.version,
            tools = capabilities.tools.len(),
            resources = capabilities.resources.len(),
            prompts = capabilities.prompts.len(),
            connect_ms = elapsed_ms,
            "Connected"
        );
        self.hooks
            .trigger(&ClientEvent::ServerConnected {
                server_name: name.to_string(),
            })
            .await;

        Ok(capabilities)
    }

    async fn establish(&self, name: &str, server: &ServerConfig) -> Result<Established> {
        let transport = self.connector.open(name, server, &self.config).await?;

        let handshake = async {
            let params = serde_json::to_value(InitializeParams::new(&self.config.client_name))?;
            let raw = transport.request("initialize", Some(params)).await?;
            let init: InitializeResult = serde_json::from_value(raw)?;
            transport.notify(INITIALIZED_NOTIFICATION, None).await?;
            let capabilities = self
                .discover(name, transport.as_ref(), &init.capabilities)
                .await?;
            Ok::<_, ToolgateError>((init, capabilities))
        };

        let outcome = tokio::time::timeout(self.config.handshake_timeout, handshake).await;
        let failure = match outcome {
            Ok(Ok((init, capabilities))) => {
                return Ok(Established {
                    transport,
                    init,
                    capabilities,
                });
            }
            Ok(Err(e)) => handshake_error(name, e),
            Err(_) => ToolgateError::Connection(format!(
                "Handshake with '{}' timed out after {:?}",
                name, self.config.handshake_timeout
            )),
        };

        if let Err(e) = transport.close().await {
            debug!(server = %name, error = %e, "Failed to close half-open transport");
        }
        Err(failure)
    }

    async fn fail_connect(&self, name: &str, e: &ToolgateError) {
        error!(server = %name, error = %e, "Connection failed");
        self.monitor.record_error(name, None, &e.to_string()).await;
        self.hooks
            .trigger(&ClientEvent::ServerError {
                server_name: name.to_string(),
                error: e.to_string(),
            })
            .await;
    }

    async fn discover(
        &self,
        name: &str,
        transport: &dyn Transport,
        advertised: &ServerCapabilities,
    ) -> Result<DiscoveredCapabilities> {
        let mut capabilities = DiscoveredCapabilities::default();
        if advertised.advertises_tools() {
            capabilities.tools = self.list_paginated(name, transport, "tools/list", "tools").await?;
        }

        // resources and prompts are optional extras; a server that fails them still connects
        if advertised.resources.is_some() {
            match self
                .list_paginated(name, transport, "resources/list", "resources")
                .await
            {
                Ok(resources) => capabilities.resources = resources,
                Err(e) => warn!(server = %name, error = %e, "Resource discovery failed"),
            }
        }
        if advertised.prompts.is_some() {
            match self
                .list_paginated(name, transport, "prompts/list", "prompts")
                .await
            {
                Ok(prompts) => capabilities.prompts = prompts,
                Err(e) => warn!(server = %name, error = %e, "Prompt discovery failed"),
            }
        }
        Ok(capabilities)
    }

    /// Follow `nextCursor` until the list ends or the item cap is reached.
    async fn list_paginated<T: DeserializeOwned>(
        &self,
        name: &str,
        transport: &dyn Transport,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = transport.request(method, params).await?;

            for raw in page.get(key).and_then(Value::as_array).into_iter().flatten() {
                if items.len() >= self.config.max_list_items {
                    warn!(
                        server = %name,
                        method = %method,
                        cap = self.config.max_list_items,
                        "List truncated"
                    );
                    return Ok(items);
                }
                match serde_json::from_value::<T>(raw.clone()) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(server = %name, method = %method, error = %e, "Skipping malformed entry"),
                }
            }

            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.to_string()) {
                        warn!(server = %name, method = %method, cursor = %next, "Cursor repeated");
                        break;
                    }
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(items)
    }

    /// Transport of a connected server
    async fn transport_for(&self, name: &str) -> Result<Arc<dyn Transport>> {
        let connections = self.connections.read().await;
        let connection = connections
            .get(name)
            .ok_or_else(|| ToolgateError::NotFound(format!("Server not found: {}", name)))?;

        match (&connection.transport, connection.state) {
            (Some(transport), ConnectionState::Connected) => Ok(transport.clone()),
            (_, state) => Err(ToolgateError::Connection(format!(
                "Server '{}' is not connected ({})",
                name, state
            ))),
        }
    }

    /// Fetch the current tool list from a connected server.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<McpTool>> {
        let transport = self.transport_for(name).await?;
        let tools: Vec<McpTool> = self
            .list_paginated(name, transport.as_ref(), "tools/list", "tools")
            .await?;

        if let Some(entry) = self.connections.write().await.get_mut(name) {
            entry.capabilities.tools = tools.clone();
        }
        Ok(tools)
    }

    pub async fn list_resources(&self, name: &str) -> Result<Vec<McpResource>> {
        let transport = self.transport_for(name).await?;
        self.list_paginated(name, transport.as_ref(), "resources/list", "resources")
            .await
    }

    pub async fn list_prompts(&self, name: &str) -> Result<Vec<McpPrompt>> {
        let transport = self.transport_for(name).await?;
        self.list_paginated(name, transport.as_ref(), "prompts/list", "prompts")
            .await
    }

    /// Invoke a tool and return the server's raw result.
    ///
    /// Every call is timed; failures are also counted against the server.
    /// No retries happen here.
    pub async fn call_tool(&self, name: &str, tool: &str, args: Value) -> Result<Value> {
        let transport = self.transport_for(name).await?;
        let arguments = match args {
            Value::Null => json!({}),
            other => other,
        };

        debug!(server = %name, tool = %tool, "Calling tool");
        let started = Instant::now();
        let result = transport
            .request("tools/call", Some(json!({ "name": tool, "arguments": arguments })))
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.monitor.record_tool_latency(name, tool, latency_ms).await;
        if let Err(e) = &result {
            error!(server = %name, tool = %tool, error = %e, latency_ms, "Tool call failed");
            self.monitor.record_error(name, Some(tool), &e.to_string()).await;
            if transport.is_closed() {
                self.mark_error(name).await;
            }
        } else {
            debug!(server = %name, tool = %tool, latency_ms, "Tool call finished");
        }

        self.hooks
            .trigger(&ClientEvent::ToolCalled {
                server_name: name.to_string(),
                tool_name: tool.to_string(),
                latency_ms,
                error: result.as_ref().err().map(|e| e.to_string()),
            })
            .await;

        result
    }

    async fn mark_error(&self, name: &str) {
        if let Some(entry) = self.connections.write().await.get_mut(name) {
            warn!(server = %name, "Transport closed; connection marked as failed");
            entry.state = ConnectionState::Error;
        }
    }

    /// Tear down a connection. Unknown names are ignored.
    ///
    /// Hooks observe the disconnect before the transport is closed, so
    /// anything derived from the connection is gone by the time it is.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        if !self.connections.read().await.contains_key(name) {
            debug!(server = %name, "Disconnect of unknown server ignored");
            return Ok(());
        }

        self.hooks
            .trigger(&ClientEvent::ServerDisconnected {
                server_name: name.to_string(),
            })
            .await;

        let removed = self.connections.write().await.remove(name);
        let Some(mut connection) = removed else {
            return Ok(());
        };
        connection.state = ConnectionState::Disconnected;

        if let Some(transport) = connection.transport.take() {
            transport.close().await?;
        }
        info!(server = %name, "Disconnected");
        Ok(())
    }

    /// Disconnect every server concurrently.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        let outcomes = join_all(names.iter().map(|name| self.disconnect(name))).await;

        for (name, outcome) in names.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(server = %name, error = %e, "Disconnect during shutdown failed");
            }
        }
        info!(servers = names.len(), "Client manager shut down");
    }

    /// Names of connected servers, sorted
    pub async fn get_connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn connection_state(&self, name: &str) -> Option<ConnectionState> {
        self.connections.read().await.get(name).map(|c| c.state)
    }

    /// Snapshot of a connection
    pub async fn connection(&self, name: &str) -> Option<ServerConnection> {
        self.connections.read().await.get(name).cloned()
    }

    /// Capabilities discovered for a connected server
    pub async fn capabilities(&self, name: &str) -> Option<DiscoveredCapabilities> {
        self.connections
            .read()
            .await
            .get(name)
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.capabilities.clone())
    }

    pub async fn get_metrics(&self) -> PerformanceSummary {
        self.monitor.get_summary().await
    }
}

fn handshake_error(name: &str, error: ToolgateError) -> ToolgateError {
    match error {
        ToolgateError::Connection(_) => error,
        other => ToolgateError::Connection(format!("Handshake with '{}' failed: {}", name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::transport::{MemoryConnector, MemoryServer};

    fn manager_with(servers: Vec<MemoryServer>) -> (ClientManager, MemoryConnector) {
        let connector = MemoryConnector::new();
        for server in servers {
            connector.add_server(server);
        }
        let manager = ClientManager::new(
            ClientConfig::default(),
            Arc::new(connector.clone()),
            PerformanceMonitor::new(),
        );
        (manager, connector)
    }

    fn filesystem() -> MemoryServer {
        MemoryServer::new("filesystem")
            .with_tool(McpTool::new("read_file", "Read a file"))
            .with_tool(McpTool::new("write_file", "Write a file"))
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let server = filesystem();
        let (manager, _) = manager_with(vec![server.clone()]);

        let first = manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();
        let second = manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.tools.len(), 2);
        assert_eq!(server.handshake_count(), 1);
        assert_eq!(server.notifications(), vec![INITIALIZED_NOTIFICATION]);
        assert_eq!(
            manager.connection_state("filesystem").await,
            Some(ConnectionState::Connected)
        );
        assert!(manager
            .monitor()
            .get_connection_times()
            .await
            .contains_key("filesystem"));
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_no_entry() {
        let (manager, _) = manager_with(vec![MemoryServer::new("broken").failing_handshake()]);
        let (hook, mut events) = event_channel();
        manager.add_hook(hook);

        let err = manager.connect("broken", &ServerConfig::memory()).await.unwrap_err();
        assert!(matches!(err, ToolgateError::Connection(_)));
        assert!(manager.get_connected_servers().await.is_empty());
        assert!(manager.connection_state("broken").await.is_none());
        assert_eq!(manager.monitor().get_error_counts().await["broken"], 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::ServerError { server_name, .. } if server_name == "broken"
        ));
    }

    #[tokio::test]
    async fn test_tool_list_follows_cursor_up_to_cap() {
        let mut server = MemoryServer::new("big").with_page_size(3);
        for i in 0..10 {
            server = server.with_tool(McpTool::new(format!("tool_{}", i), ""));
        }
        let connector = MemoryConnector::new();
        connector.add_server(server);
        let config = ClientConfig {
            max_list_items: 7,
            ..ClientConfig::default()
        };
        let manager = ClientManager::new(config, Arc::new(connector), PerformanceMonitor::new());

        let capabilities = manager.connect("big", &ServerConfig::memory()).await.unwrap();
        assert_eq!(capabilities.tools.len(), 7);
        assert_eq!(capabilities.tools[6].name, "tool_6");
    }

    #[tokio::test]
    async fn test_call_tool_errors() {
        let (manager, _) = manager_with(vec![filesystem()]);

        let err = manager
            .call_tool("nowhere", "read_file", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Server not found: nowhere");
        assert!(!err.is_retryable());

        manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();
        let err = manager
            .call_tool("filesystem", "format_disk", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolgateError::Protocol { .. }));

        let latencies = manager.monitor().get_tool_latencies().await;
        assert_eq!(latencies["filesystem:format_disk"].count, 1);
        assert_eq!(manager.monitor().get_error_counts().await["filesystem"], 1);
    }

    #[tokio::test]
    async fn test_crashed_transport_marks_error_state() {
        let server = filesystem();
        let (manager, _) = manager_with(vec![server.clone()]);
        manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();

        server.crash();
        let err = manager
            .call_tool("filesystem", "read_file", json!({ "path": "a" }))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            manager.connection_state("filesystem").await,
            Some(ConnectionState::Error)
        );

        let err = manager
            .call_tool("filesystem", "read_file", json!({ "path": "a" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolgateError::Connection(_)));

        // a stale error entry can be replaced by a fresh connect
        server.restart();
        manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();
        assert_eq!(manager.get_connected_servers().await, vec!["filesystem"]);
    }

    #[tokio::test]
    async fn test_disconnect_and_shutdown() {
        let (manager, _) = manager_with(vec![filesystem(), MemoryServer::new("git")]);
        let (hook, mut events) = event_channel();
        manager.add_hook(hook);

        manager.disconnect("ghost").await.unwrap();

        manager.connect("filesystem", &ServerConfig::memory()).await.unwrap();
        manager.connect("git", &ServerConfig::memory()).await.unwrap();
        assert_eq!(manager.get_connected_servers().await, vec!["filesystem", "git"]);

        manager.disconnect("filesystem").await.unwrap();
        assert_eq!(manager.get_connected_servers().await, vec!["git"]);

        manager.shutdown().await;
        assert!(manager.get_connected_servers().await.is_empty());

        let mut disconnected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::ServerDisconnected { server_name } = event {
                disconnected.push(server_name);
            }
        }
        assert_eq!(disconnected, vec!["filesystem", "git"]);
    }
}
