//! Client lifecycle events and hooks
//!
//! The client manager announces connections, disconnections, failures and
//! tool calls through a [`HookRegistry`]. Hooks are observers: a failing
//! hook is logged and never affects the operation that triggered it.
//!
//! # Example
//!
//! ```rust,ignore
//! use toolgate_core::events::{HookRegistry, LoggingHook};
//!
//! let hooks = HookRegistry::new();
//! hooks.register(Arc::new(LoggingHook));
//! hooks.trigger(&ClientEvent::ServerConnected { server_name: "fs".into() }).await;
//! ```

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Something that happened to a server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    ServerConnected {
        server_name: String,
    },
    ServerDisconnected {
        server_name: String,
    },
    ServerError {
        server_name: String,
        error: String,
    },
    ToolCalled {
        server_name: String,
        tool_name: String,
        latency_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ClientEvent {
    pub fn server_name(&self) -> &str {
        match self {
            ClientEvent::ServerConnected { server_name }
            | ClientEvent::ServerDisconnected { server_name }
            | ClientEvent::ServerError { server_name, .. }
            | ClientEvent::ToolCalled { server_name, .. } => server_name,
        }
    }
}

/// Result type for hooks
pub type HookResult = Result<()>;

/// Trait for client lifecycle hooks
#[async_trait]
pub trait ClientEventHook: Send + Sync {
    /// Called after a handshake and discovery succeeded
    async fn on_server_connected(&self, _server_name: &str) -> HookResult {
        Ok(())
    }

    /// Called before a connection is torn down
    async fn on_server_disconnected(&self, _server_name: &str) -> HookResult {
        Ok(())
    }

    /// Called when connecting fails
    async fn on_server_error(&self, _server_name: &str, _error: &str) -> HookResult {
        Ok(())
    }

    /// Called after every tool call, successful or not
    async fn on_tool_called(
        &self,
        _server_name: &str,
        _tool_name: &str,
        _latency_ms: f64,
        _error: Option<&str>,
    ) -> HookResult {
        Ok(())
    }
}

/// Registry for managing hooks
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ClientEventHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook
    pub fn register(&self, hook: Arc<dyn ClientEventHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ClientEventHook>> {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Deliver an event to every hook in registration order.
    pub async fn trigger(&self, event: &ClientEvent) {
        for hook in self.snapshot() {
            let outcome = match event {
                ClientEvent::ServerConnected { server_name } => {
                    hook.on_server_connected(server_name).await
                }
                ClientEvent::ServerDisconnected { server_name } => {
                    hook.on_server_disconnected(server_name).await
                }
                ClientEvent::ServerError { server_name, error } => {
                    hook.on_server_error(server_name, error).await
                }
                ClientEvent::ToolCalled {
                    server_name,
                    tool_name,
                    latency_ms,
                    error,
                } => {
                    hook.on_tool_called(server_name, tool_name, *latency_ms, error.as_deref())
                        .await
                }
            };
            if let Err(e) = outcome {
                tracing::warn!(
                    server = %event.server_name(),
                    error = %e,
                    "Event hook failed"
                );
            }
        }
    }
}

/// Example hook: Logging hook
pub struct LoggingHook;

#[async_trait]
impl ClientEventHook for LoggingHook {
    async fn on_server_connected(&self, server_name: &str) -> HookResult {
        tracing::info!(server = %server_name, "Server connected");
        Ok(())
    }

    async fn on_server_disconnected(&self, server_name: &str) -> HookResult {
        tracing::info!(server = %server_name, "Server disconnected");
        Ok(())
    }

    async fn on_server_error(&self, server_name: &str, error: &str) -> HookResult {
        tracing::warn!(server = %server_name, error = %error, "Server error");
        Ok(())
    }

    async fn on_tool_called(
        &self,
        server_name: &str,
        tool_name: &str,
        latency_ms: f64,
        error: Option<&str>,
    ) -> HookResult {
        tracing::debug!(
            server = %server_name,
            tool = %tool_name,
            latency_ms,
            failed = error.is_some(),
            "Tool called"
        );
        Ok(())
    }
}

/// Forwards every event into an unbounded channel
pub struct ChannelHook {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelHook {
    pub fn new(tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self { tx }
    }

    fn forward(&self, event: ClientEvent) -> HookResult {
        // a dropped receiver just means nobody listens anymore
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[async_trait]
impl ClientEventHook for ChannelHook {
    async fn on_server_connected(&self, server_name: &str) -> HookResult {
        self.forward(ClientEvent::ServerConnected {
            server_name: server_name.to_string(),
        })
    }

    async fn on_server_disconnected(&self, server_name: &str) -> HookResult {
        self.forward(ClientEvent::ServerDisconnected {
            server_name: server_name.to_string(),
        })
    }

    async fn on_server_error(&self, server_name: &str, error: &str) -> HookResult {
        self.forward(ClientEvent::ServerError {
            server_name: server_name.to_string(),
            error: error.to_string(),
        })
    }

    async fn on_tool_called(
        &self,
        server_name: &str,
        tool_name: &str,
        latency_ms: f64,
        error: Option<&str>,
    ) -> HookResult {
        self.forward(ClientEvent::ToolCalled {
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            latency_ms,
            error: error.map(str::to_string),
        })
    }
}

/// A channel hook together with the receiving end of its events
pub fn event_channel() -> (Arc<ChannelHook>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHook::new(tx)), rx)
}
