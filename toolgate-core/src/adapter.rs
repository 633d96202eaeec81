//! Bridges server tools into the agent's tool registry
//!
//! Every tool of a connected server is published under a composite id,
//! `mcp_<server>_<tool>`, so tools with the same name on different servers
//! never collide. Execution resolves the id back to its owner, asks the
//! [`SecurityPolicy`] and only then reaches the server.

use crate::client::ClientManager;
use crate::config::ToolgateConfig;
use crate::error::{Result, ToolgateError};
use crate::events::{ClientEventHook, HookResult};
use crate::registry::{RegisteredTool, ToolRegistry};
use crate::result::ToolOutput;
use crate::security::{NOT_AUTHORIZED, SecurityPolicy};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Prefix shared by every composite tool id
pub const TOOL_ID_PREFIX: &str = "mcp_";

/// The id a server tool is published under
pub fn composite_tool_id(server: &str, tool: &str) -> String {
    format!("{}{}_{}", TOOL_ID_PREFIX, server, tool)
}

/// Which server a composite id belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOwner {
    pub server_name: String,
    pub original_name: String,
}

/// Outcome of connecting the configured servers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitReport {
    pub connected: Vec<String>,
    /// Server name and the reason it failed
    pub failed: Vec<(String, String)>,
    /// Disabled or not marked for auto-connect
    pub skipped: Vec<String>,
}

#[derive(Debug, Default)]
struct Catalog {
    by_server: HashMap<String, Vec<String>>,
    owners: HashMap<String, ToolOwner>,
}

/// Publishes server tools and routes their execution through the policy
pub struct ToolAdapter {
    client: Arc<ClientManager>,
    policy: Arc<SecurityPolicy>,
    registry: Arc<dyn ToolRegistry>,
    catalog: RwLock<Catalog>,
}

impl std::fmt::Debug for ToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAdapter")
            .field("client", &self.client)
            .finish()
    }
}

/// Keeps the catalog in step with connections
struct CatalogSync {
    adapter: Weak<ToolAdapter>,
}

#[async_trait]
impl ClientEventHook for CatalogSync {
    async fn on_server_connected(&self, server_name: &str) -> HookResult {
        if let Some(adapter) = self.adapter.upgrade() {
            if let Err(e) = adapter.register_server_tools(server_name).await {
                warn!(server = %server_name, error = %e, "Failed to register tools");
            }
        }
        Ok(())
    }

    async fn on_server_disconnected(&self, server_name: &str) -> HookResult {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.unregister_server_tools(server_name).await;
        }
        Ok(())
    }
}

impl ToolAdapter {
    /// Create the adapter and subscribe it to the client's connection events.
    pub fn new(
        client: Arc<ClientManager>,
        policy: Arc<SecurityPolicy>,
        registry: Arc<dyn ToolRegistry>,
    ) -> Arc<Self> {
        let adapter = Arc::new(Self {
            client,
            policy,
            registry,
            catalog: RwLock::new(Catalog::default()),
        });
        adapter.client.add_hook(Arc::new(CatalogSync {
            adapter: Arc::downgrade(&adapter),
        }));
        adapter
    }

    pub fn client(&self) -> &Arc<ClientManager> {
        &self.client
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<dyn ToolRegistry> {
        &self.registry
    }

    /// Connect every enabled server marked for auto-connect, concurrently.
    pub async fn initialize_servers(&self, config: &ToolgateConfig) -> InitReport {
        let mut report = InitReport::default();
        let mut targets = Vec::new();
        for (name, server) in &config.servers {
            if server.should_auto_connect() {
                targets.push((name, server));
            } else {
                debug!(server = %name, enabled = server.enabled, "Skipping server");
                report.skipped.push(name.clone());
            }
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|(name, server)| self.client.connect(name, server)),
        )
        .await;

        for ((name, _), outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.connected.push(name.clone()),
                Err(e) => report.failed.push((name.clone(), e.to_string())),
            }
        }

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Initialized servers"
        );
        report
    }

    /// Fetch a server's tools and publish them, replacing earlier ones.
    ///
    /// A tool the registry rejects is skipped; the rest still register.
    pub async fn register_server_tools(&self, server: &str) -> Result<usize> {
        let tools = self.client.list_tools(server).await?;
        self.unregister_server_tools(server).await;

        let mut published = Vec::with_capacity(tools.len());
        for tool in tools {
            let id = composite_tool_id(server, &tool.name);
            let registered = RegisteredTool {
                id: id.clone(),
                description: tool.description,
                parameters: tool.input_schema,
                server_name: server.to_string(),
                original_name: tool.name.clone(),
            };
            match self.registry.register(registered) {
                Ok(()) => published.push((
                    id,
                    ToolOwner {
                        server_name: server.to_string(),
                        original_name: tool.name,
                    },
                )),
                Err(e) => warn!(server = %server, tool = %tool.name, error = %e, "Skipping tool"),
            }
        }

        let count = published.len();
        {
            let mut catalog = self.catalog.write().await;
            let ids = published.iter().map(|(id, _)| id.clone()).collect();
            catalog.by_server.insert(server.to_string(), ids);
            catalog.owners.extend(published);
        }

        info!(server = %server, tools = count, "Registered tools");
        Ok(count)
    }

    /// Withdraw every tool a server published. Returns how many were removed.
    pub async fn unregister_server_tools(&self, server: &str) -> usize {
        let removed = {
            let mut catalog = self.catalog.write().await;
            let ids = catalog.by_server.remove(server).unwrap_or_default();
            for id in &ids {
                catalog.owners.remove(id);
            }
            ids
        };

        for id in &removed {
            self.registry.unregister(id);
        }
        if !removed.is_empty() {
            debug!(server = %server, tools = removed.len(), "Unregistered tools");
        }
        removed.len()
    }

    /// Run a tool by composite id once the policy allows it.
    pub async fn execute_tool(&self, tool_id: &str, params: Value) -> Result<ToolOutput> {
        let owner = self
            .tool_owner(tool_id)
            .await
            .ok_or_else(|| ToolgateError::NotFound(format!("Tool not found: {}", tool_id)))?;

        let verdict = self
            .policy
            .validate_operation(&owner.server_name, &owner.original_name, &params)
            .await?;
        if !verdict.allowed {
            let reason = verdict.reason();
            warn!(tool = %tool_id, reason = %reason, "Tool call blocked");
            if reason == NOT_AUTHORIZED {
                return Err(ToolgateError::ConsentTimeout);
            }
            return Err(ToolgateError::PermissionDenied(reason.to_string()));
        }

        let raw = self
            .client
            .call_tool(&owner.server_name, &owner.original_name, params)
            .await?;
        Ok(ToolOutput::from_call_result(&raw))
    }

    /// Registered definitions of every published tool, sorted by id
    pub async fn tool_definitions(&self) -> Vec<RegisteredTool> {
        let ids = self.known_tools().await;
        ids.iter().filter_map(|id| self.registry.get(id)).collect()
    }

    /// Composite ids of every published tool, sorted
    pub async fn known_tools(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.catalog.read().await.owners.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn tool_owner(&self, tool_id: &str) -> Option<ToolOwner> {
        self.catalog.read().await.owners.get(tool_id).cloned()
    }

    /// Composite ids a server published
    pub async fn server_tools(&self, server: &str) -> Vec<String> {
        self.catalog
            .read()
            .await
            .by_server
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    /// Servers with published tools, sorted
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.read().await.by_server.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ConfigBuilder, SecurityConfig, ServerConfig};
    use crate::monitor::PerformanceMonitor;
    use crate::protocol::McpTool;
    use crate::registry::InMemoryToolRegistry;
    use crate::security::PermissionProfile;
    use crate::transport::{MemoryConnector, MemoryServer};
    use serde_json::json;

    fn adapter_with(servers: Vec<MemoryServer>) -> Arc<ToolAdapter> {
        let connector = MemoryConnector::new();
        for server in servers {
            connector.add_server(server);
        }
        let client = Arc::new(ClientManager::new(
            ClientConfig::default(),
            Arc::new(connector),
            PerformanceMonitor::new(),
        ));
        let policy = Arc::new(SecurityPolicy::new(&SecurityConfig::default()));
        ToolAdapter::new(client, policy, Arc::new(InMemoryToolRegistry::new()))
    }

    #[test]
    fn test_composite_id_format() {
        assert_eq!(composite_tool_id("filesystem", "read_file"), "mcp_filesystem_read_file");
        assert_eq!(composite_tool_id("my_db", "run_query"), "mcp_my_db_run_query");
    }

    #[tokio::test]
    async fn test_connect_publishes_and_disconnect_withdraws() {
        let adapter = adapter_with(vec![MemoryServer::new("git")
            .with_tool(McpTool::new("git_status", "Show status"))
            .with_tool(McpTool::new("git_log", "Show history"))]);

        adapter
            .client()
            .connect("git", &ServerConfig::memory())
            .await
            .unwrap();
        assert_eq!(
            adapter.known_tools().await,
            vec!["mcp_git_git_log", "mcp_git_git_status"]
        );
        assert_eq!(
            adapter.tool_owner("mcp_git_git_log").await,
            Some(ToolOwner {
                server_name: "git".to_string(),
                original_name: "git_log".to_string(),
            })
        );
        assert!(adapter.registry().contains("mcp_git_git_status"));

        adapter.client().disconnect("git").await.unwrap();
        assert!(adapter.known_tools().await.is_empty());
        assert!(adapter.server_tools("git").await.is_empty());
        assert!(!adapter.registry().contains("mcp_git_git_status"));
    }

    #[tokio::test]
    async fn test_reregistration_replaces_tools() {
        let server = MemoryServer::new("fs").with_tool(McpTool::new("read_file", ""));
        let adapter = adapter_with(vec![server.clone()]);
        adapter
            .client()
            .connect("fs", &ServerConfig::memory())
            .await
            .unwrap();

        server.set_tools(vec![McpTool::new("list_directory", "")]);
        assert_eq!(adapter.register_server_tools("fs").await.unwrap(), 1);
        assert_eq!(adapter.known_tools().await, vec!["mcp_fs_list_directory"]);
        assert!(!adapter.registry().contains("mcp_fs_read_file"));
    }

    #[tokio::test]
    async fn test_collisions_are_isolated() {
        let adapter = adapter_with(vec![MemoryServer::new("fs").with_tool(McpTool::new("read", ""))]);
        // something else already owns the id
        adapter
            .registry()
            .register(RegisteredTool {
                id: "mcp_fs_read".to_string(),
                description: String::new(),
                parameters: json!({}),
                server_name: "other".to_string(),
                original_name: "read".to_string(),
            })
            .unwrap();

        adapter
            .client()
            .connect("fs", &ServerConfig::memory())
            .await
            .unwrap();
        assert!(adapter.tool_owner("mcp_fs_read").await.is_none());
        assert_eq!(adapter.server_names().await, vec!["fs"]);
    }

    #[tokio::test]
    async fn test_execute_tool_paths() {
        let server = MemoryServer::new("filesystem")
            .with_tool(McpTool::new("read_file", ""))
            .with_handler(|_, _| Ok(json!({ "content": [{ "type": "text", "text": "hello" }] })));
        let adapter = adapter_with(vec![server.clone()]);
        adapter
            .client()
            .connect("filesystem", &ServerConfig::memory())
            .await
            .unwrap();

        let err = adapter.execute_tool("mcp_filesystem_nope", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool not found: mcp_filesystem_nope");

        let err = adapter
            .execute_tool("mcp_filesystem_read_file", json!({ "path": "/home/u/.env" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolgateError::PermissionDenied(ref r) if r.contains("forbidden path")));
        assert_eq!(server.call_count(), 0);

        adapter
            .policy()
            .set_server_permissions("filesystem", PermissionProfile::new().allow_path("notes/"))
            .await;
        let output = adapter
            .execute_tool("mcp_filesystem_read_file", json!({ "path": "/data/notes/a.md" }))
            .await
            .unwrap();
        assert_eq!(output, ToolOutput::Text("hello".to_string()));
        assert_eq!(server.call_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_servers_honours_flags() {
        let adapter = adapter_with(vec![
            MemoryServer::new("fs").with_tool(McpTool::new("read_file", "")),
            MemoryServer::new("broken").failing_handshake(),
            MemoryServer::new("off"),
        ]);
        let config = ConfigBuilder::new()
            .server("fs", ServerConfig::memory().with_auto_connect(true))
            .server("broken", ServerConfig::memory().with_auto_connect(true))
            .server(
                "off",
                ServerConfig::memory().with_auto_connect(true).with_enabled(false),
            )
            .server("manual", ServerConfig::memory())
            .build();

        let report = adapter.initialize_servers(&config).await;
        assert_eq!(report.connected, vec!["fs"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(report.skipped, vec!["manual", "off"]);
        assert_eq!(adapter.known_tools().await, vec!["mcp_fs_read_file"]);
    }
}
