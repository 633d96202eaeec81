//! Function-calling surface for the LLM loop
//!
//! The orchestration loop asks for the function catalog and calls
//! functions by name. Names are composite tool ids; since both server and
//! tool names may contain underscores, a name is split by matching it
//! against the servers that actually published tools.

use crate::adapter::{TOOL_ID_PREFIX, ToolAdapter};
use crate::config::ExecutorConfig;
use crate::error::{Result, ToolgateError};
use crate::result::FunctionResult;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// One callable function as presented to the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
}

impl FunctionDefinition {
    /// Wrap as an OpenAI-style `tools` entry.
    pub fn to_openai_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug)]
struct CachedCatalog {
    functions: Vec<FunctionDefinition>,
    built_at: Instant,
}

/// Serves the function catalog and executes function calls
pub struct FunctionExecutor {
    adapter: Arc<ToolAdapter>,
    cache: Mutex<Option<CachedCatalog>>,
    ttl: Duration,
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl FunctionExecutor {
    pub fn new(adapter: Arc<ToolAdapter>, config: &ExecutorConfig) -> Self {
        Self {
            adapter,
            cache: Mutex::new(None),
            ttl: config.cache_ttl,
        }
    }

    pub fn adapter(&self) -> &Arc<ToolAdapter> {
        &self.adapter
    }

    /// The function catalog, sorted by name.
    ///
    /// The list is rebuilt at most once per cache TTL unless
    /// [`clear_cache`](Self::clear_cache) is called.
    pub async fn get_functions(&self) -> Vec<FunctionDefinition> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                return cached.functions.clone();
            }
        }

        let mut functions: Vec<FunctionDefinition> = self
            .adapter
            .tool_definitions()
            .await
            .into_iter()
            .map(|tool| FunctionDefinition {
                name: tool.id,
                description: tool.description,
                parameters: tool.parameters,
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(functions = functions.len(), "Rebuilt function catalog");
        *cache = Some(CachedCatalog {
            functions: functions.clone(),
            built_at: Instant::now(),
        });
        functions
    }

    /// The catalog as OpenAI-style `tools` entries
    pub async fn openai_tools(&self) -> Vec<Value> {
        self.get_functions()
            .await
            .iter()
            .map(FunctionDefinition::to_openai_tool)
            .collect()
    }

    pub async fn clear_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Split a function name into `(server, tool)`.
    ///
    /// Only names of currently published tools parse; the longest server
    /// name that yields a published tool wins.
    pub async fn parse_function_name(&self, name: &str) -> Option<(String, String)> {
        let rest = name.strip_prefix(TOOL_ID_PREFIX)?;

        let mut servers = self.adapter.server_names().await;
        servers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for server in servers {
            let Some(tool) = rest
                .strip_prefix(server.as_str())
                .and_then(|r| r.strip_prefix('_'))
            else {
                continue;
            };
            if tool.is_empty() {
                continue;
            }
            if let Some(owner) = self.adapter.tool_owner(name).await {
                if owner.server_name == server && owner.original_name == tool {
                    return Some((server, tool.to_string()));
                }
            }
        }
        None
    }

    /// Call a function on behalf of the LLM.
    ///
    /// Only an unknown name is an error. Once the name resolves, policy
    /// refusals, transport failures and tool-reported errors all come back
    /// as failed results the model can read.
    pub async fn execute(&self, name: &str, params: Value) -> Result<FunctionResult> {
        let (server, tool) = self
            .parse_function_name(name)
            .await
            .ok_or_else(|| ToolgateError::NotFound(format!("Unknown MCP function: {}", name)))?;

        info!(function = %name, server = %server, tool = %tool, "Executing function");
        match self.adapter.execute_tool(name, params).await {
            Ok(output) => Ok(FunctionResult::from(output)),
            Err(e) => {
                debug!(function = %name, error = %e, "Function failed");
                Ok(FunctionResult::failure(e.to_string()))
            }
        }
    }
}
