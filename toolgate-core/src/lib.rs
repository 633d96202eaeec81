//! # Toolgate - Safe tool-server integration for agents
//!
//! Toolgate lets an agent discover and call tools exposed by independent
//! tool servers (filesystem, databases, version control, ...) speaking
//! JSON-RPC 2.0 over stdio or streamable HTTP:
//! - Connection management with capability discovery
//! - A security boundary with path rules, risk scoring and human consent
//! - Tool registration under collision-free composite ids
//! - A cached function catalog for LLM function calling
//! - Latency and availability metrics with pass/fail targets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use toolgate_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ToolgateConfig::load()?;
//!     let toolgate = Toolgate::from_config(config);
//!     toolgate.start().await;
//!
//!     for function in toolgate.executor().get_functions().await {
//!         println!("{}: {}", function.name, function.description);
//!     }
//!
//!     let result = toolgate
//!         .executor()
//!         .execute("mcp_filesystem_read_file", serde_json::json!({ "path": "notes/a.md" }))
//!         .await?;
//!     println!("{:?}", result);
//!
//!     toolgate.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **PerformanceMonitor**: aggregates connection times, latencies and errors
//! - **SecurityPolicy**: decides every call, suspending for consent when needed
//! - **ClientManager**: owns transports and performs the protocol calls
//! - **ToolAdapter**: mirrors discovered tools into a registry and gates execution
//! - **FunctionExecutor**: the catalog and call entry point for the LLM loop

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod result;
pub mod security;
pub mod transport;

use std::sync::Arc;

use crate::adapter::{InitReport, ToolAdapter};
use crate::client::ClientManager;
use crate::config::ToolgateConfig;
use crate::executor::FunctionExecutor;
use crate::monitor::PerformanceMonitor;
use crate::registry::{InMemoryToolRegistry, ToolRegistry};
use crate::security::SecurityPolicy;
use crate::transport::{Connector, DefaultConnector};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// All five components wired together from one configuration
pub struct Toolgate {
    config: ToolgateConfig,
    monitor: PerformanceMonitor,
    policy: Arc<SecurityPolicy>,
    client: Arc<ClientManager>,
    adapter: Arc<ToolAdapter>,
    executor: Arc<FunctionExecutor>,
}

impl std::fmt::Debug for Toolgate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolgate")
            .field("servers", &self.config.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Toolgate {
    /// Build with the stdio/http connector and an in-memory registry.
    pub fn from_config(config: ToolgateConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(DefaultConnector),
            Arc::new(InMemoryToolRegistry::new()),
        )
    }

    /// Build with a custom connector and registry.
    pub fn with_parts(
        config: ToolgateConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<dyn ToolRegistry>,
    ) -> Self {
        let monitor = PerformanceMonitor::new();
        let policy = Arc::new(SecurityPolicy::new(&config.security));
        let client = Arc::new(ClientManager::new(
            config.client.clone(),
            connector,
            monitor.clone(),
        ));
        client.add_hook(Arc::new(events::LoggingHook));
        let adapter = ToolAdapter::new(client.clone(), policy.clone(), registry);
        let executor = Arc::new(FunctionExecutor::new(adapter.clone(), &config.executor));

        Self {
            config,
            monitor,
            policy,
            client,
            adapter,
            executor,
        }
    }

    /// Connect every enabled auto-connect server.
    pub async fn start(&self) -> InitReport {
        let report = self.adapter.initialize_servers(&self.config).await;
        self.executor.clear_cache().await;
        report
    }

    /// Disconnect everything.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        self.executor.clear_cache().await;
    }

    pub fn config(&self) -> &ToolgateConfig {
        &self.config
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    pub fn client(&self) -> &Arc<ClientManager> {
        &self.client
    }

    pub fn adapter(&self) -> &Arc<ToolAdapter> {
        &self.adapter
    }

    pub fn executor(&self) -> &Arc<FunctionExecutor> {
        &self.executor
    }
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::Toolgate;
    pub use crate::adapter::{InitReport, ToolAdapter, ToolOwner, composite_tool_id};
    pub use crate::client::{ClientManager, ConnectionState, DiscoveredCapabilities};
    pub use crate::config::{
        ClientConfig, ConfigBuilder, ExecutorConfig, SecurityConfig, ServerConfig, ToolgateConfig,
    };
    pub use crate::error::{Result, ToolgateError};
    pub use crate::events::{
        ChannelHook, ClientEvent, ClientEventHook, HookRegistry, LoggingHook, event_channel,
    };
    pub use crate::executor::{FunctionDefinition, FunctionExecutor};
    pub use crate::monitor::{LatencyStats, PerformanceMonitor, PerformanceSummary, PocEvaluation};
    pub use crate::protocol::{McpPrompt, McpResource, McpTool, ServerInfo};
    pub use crate::registry::{InMemoryToolRegistry, RegisteredTool, RegistryError, ToolRegistry};
    pub use crate::result::{FunctionResult, ToolOutput};
    pub use crate::security::{
        AuditFilter, ConsentChoice, ConsentRequest, OperationType, PermissionProfile, RiskLevel,
        SecurityPolicy, ValidationResult,
    };
    pub use crate::transport::{
        Connector, DefaultConnector, MemoryConnector, MemoryServer, Transport, TransportKind,
    };
}
