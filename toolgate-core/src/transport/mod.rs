//! Transports to tool servers
//!
//! A transport moves JSON-RPC messages between us and one server. The
//! client manager only sees the [`Transport`] trait; how a transport is
//! opened for a given server config is the job of a [`Connector`].
//!
//! - `stdio`: spawns a subprocess and speaks newline-delimited JSON-RPC
//! - `http`: streamable HTTP, answers arrive as JSON or as an event stream
//! - `memory`: in-process scripted servers for tests and embedding

pub mod http;
pub mod memory;
pub mod stdio;

pub use http::HttpTransport;
pub use memory::{MemoryConnector, MemoryServer, MemoryTransport};
pub use stdio::StdioTransport;

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, ToolgateError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Which kind of transport a server uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Memory => "memory",
        };
        write!(f, "{}", name)
    }
}

/// An open, bidirectional channel to one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Send a notification; no answer is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Close the channel and release its resources.
    async fn close(&self) -> Result<()>;

    /// Whether the peer is gone; requests on a closed transport fail.
    fn is_closed(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Opens transports for server configs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        name: &str,
        server: &ServerConfig,
        client: &ClientConfig,
    ) -> Result<Arc<dyn Transport>>;
}

/// Opens stdio and http transports
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        name: &str,
        server: &ServerConfig,
        client: &ClientConfig,
    ) -> Result<Arc<dyn Transport>> {
        match server.transport {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::spawn(name, server, client)?)),
            TransportKind::Http => Ok(Arc::new(HttpTransport::new(name, server, client)?)),
            TransportKind::Memory => Err(ToolgateError::Configuration(format!(
                "Server '{}' uses the memory transport, which needs a MemoryConnector",
                name
            ))),
        }
    }
}

/// Error for a request on a transport whose peer is gone
pub(crate) fn closed_error(name: &str) -> ToolgateError {
    ToolgateError::Connection(format!("Transport to '{}' is closed", name))
}
