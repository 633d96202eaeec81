//! Tool registry for registration, lookup, and discovery
//!
//! The adapter mirrors every connected server's tools into a
//! [`ToolRegistry`] under their composite ids. The registry provides:
//! - Registration with duplicate detection
//! - Lookup by composite id
//! - Substring discovery over names and descriptions
//!
//! # Example
//!
//! ```rust,ignore
//! use toolgate_core::registry::{InMemoryToolRegistry, RegisteredTool, ToolRegistry};
//!
//! let registry = InMemoryToolRegistry::new();
//! registry.register(tool)?;
//!
//! let tool = registry.get("mcp_filesystem_read_file");
//! let matches = registry.discover("read a file", 5);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Tool with this id already exists
    DuplicateTool(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateTool(id) => {
                write!(f, "Tool '{}' is already registered", id)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// A server tool as the rest of the agent sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTool {
    /// Composite id, `mcp_<server>_<tool>`
    pub id: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: Value,
    pub server_name: String,
    pub original_name: String,
}

/// Result of a tool discovery search
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    /// The matching tool
    pub tool: RegisteredTool,
    /// Relevance score (0.0 to 1.0)
    pub score: f32,
}

/// Discovery strategy for finding tools
pub trait DiscoveryStrategy: Send + Sync {
    /// Score how well a tool matches the query (0.0 to 1.0)
    fn score(&self, query: &str, tool: &RegisteredTool) -> f32;
}

/// Simple substring-based discovery strategy
///
/// Matches the query against the tool's original name, composite id and
/// description.
#[derive(Debug, Clone, Default)]
pub struct SubstringDiscovery;

impl DiscoveryStrategy for SubstringDiscovery {
    fn score(&self, query: &str, tool: &RegisteredTool) -> f32 {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() {
            return 0.0;
        }
        let name = tool.original_name.to_lowercase();

        // Exact name match = highest score
        if name == query_lower || tool.id.to_lowercase() == query_lower {
            return 1.0;
        }

        let mut score = 0.0f32;
        if name.contains(&query_lower) || tool.id.to_lowercase().contains(&query_lower) {
            score = score.max(0.9);
        }

        let desc_lower = tool.description.to_lowercase();
        if desc_lower.contains(&query_lower) {
            score = score.max(0.7);
        }

        // Check for word overlap
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        let haystack = format!("{} {}", name.replace('_', " "), desc_lower);
        let word_matches = query_words
            .iter()
            .filter(|word| word.len() > 2 && haystack.contains(*word))
            .count();

        if !query_words.is_empty() {
            let word_score = (word_matches as f32 / query_words.len() as f32) * 0.6;
            score = score.max(word_score);
        }

        score
    }
}

/// Where the adapter publishes tools for the agent
pub trait ToolRegistry: Send + Sync {
    /// Register a tool; fails if the id is taken.
    fn register(&self, tool: RegisteredTool) -> Result<(), RegistryError>;

    /// Remove a tool, returning it if it was registered.
    fn unregister(&self, id: &str) -> Option<RegisteredTool>;

    fn get(&self, id: &str) -> Option<RegisteredTool>;

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All tools, sorted by id
    fn list(&self) -> Vec<RegisteredTool>;

    /// Tools matching a query, best first, at most `limit` of them.
    fn discover(&self, query: &str, limit: usize) -> Vec<DiscoveryResult>;
}

/// Default registry threshold for discovery matches
const DISCOVERY_THRESHOLD: f32 = 0.1;

/// Registry kept in process memory
pub struct InMemoryToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    discovery_strategy: Box<dyn DiscoveryStrategy>,
}

impl Default for InMemoryToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryToolRegistry")
            .field("tool_count", &self.len())
            .finish()
    }
}

impl InMemoryToolRegistry {
    /// Create a new empty registry with default discovery strategy
    pub fn new() -> Self {
        Self::with_discovery(Box::new(SubstringDiscovery))
    }

    /// Create a registry with a custom discovery strategy
    pub fn with_discovery(strategy: Box<dyn DiscoveryStrategy>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            discovery_strategy: strategy,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredTool>> {
        self.tools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RegisteredTool>> {
        self.tools.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn register(&self, tool: RegisteredTool) -> Result<(), RegistryError> {
        let mut tools = self.write();
        if tools.contains_key(&tool.id) {
            return Err(RegistryError::DuplicateTool(tool.id));
        }
        tools.insert(tool.id.clone(), tool);
        Ok(())
    }

    fn unregister(&self, id: &str) -> Option<RegisteredTool> {
        self.write().remove(id)
    }

    fn get(&self, id: &str) -> Option<RegisteredTool> {
        self.read().get(id).cloned()
    }

    fn list(&self) -> Vec<RegisteredTool> {
        let mut tools: Vec<RegisteredTool> = self.read().values().cloned().collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    fn discover(&self, query: &str, limit: usize) -> Vec<DiscoveryResult> {
        let mut results: Vec<DiscoveryResult> = self
            .read()
            .values()
            .filter_map(|tool| {
                let score = self.discovery_strategy.score(query, tool);
                (score >= DISCOVERY_THRESHOLD).then(|| DiscoveryResult {
                    tool: tool.clone(),
                    score,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool.id.cmp(&b.tool.id))
        });
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str, description: &str) -> RegisteredTool {
        RegisteredTool {
            id: format!("mcp_{}_{}", server, name),
            description: description.to_string(),
            parameters: json!({ "type": "object" }),
            server_name: server.to_string(),
            original_name: name.to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = InMemoryToolRegistry::new();
        registry
            .register(tool("filesystem", "read_file", "Read a file"))
            .unwrap();

        assert!(registry.contains("mcp_filesystem_read_file"));
        assert_eq!(
            registry.get("mcp_filesystem_read_file").unwrap().server_name,
            "filesystem"
        );
        assert!(registry.get("mcp_filesystem_write_file").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = InMemoryToolRegistry::new();
        registry.register(tool("fs", "read", "one")).unwrap();

        let err = registry.register(tool("fs", "read", "two")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTool("mcp_fs_read".to_string()));
        assert_eq!(err.to_string(), "Tool 'mcp_fs_read' is already registered");
        assert_eq!(registry.get("mcp_fs_read").unwrap().description, "one");
    }

    #[test]
    fn test_unregister_and_sorted_list() {
        let registry = InMemoryToolRegistry::new();
        registry.register(tool("git", "git_status", "")).unwrap();
        registry.register(tool("fs", "read_file", "")).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["mcp_fs_read_file", "mcp_git_git_status"]);

        assert!(registry.unregister("mcp_fs_read_file").is_some());
        assert!(registry.unregister("mcp_fs_read_file").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_discover_ranks_name_over_description() {
        let registry = InMemoryToolRegistry::new();
        registry
            .register(tool("fs", "read_file", "Read the contents of a file"))
            .unwrap();
        registry
            .register(tool("fs", "list_directory", "List files in a directory"))
            .unwrap();
        registry
            .register(tool("git", "git_log", "Show commit history"))
            .unwrap();

        let results = registry.discover("read_file", 10);
        assert_eq!(results[0].tool.original_name, "read_file");
        assert_eq!(results[0].score, 1.0);

        let results = registry.discover("files", 10);
        assert!(results.iter().any(|r| r.tool.original_name == "list_directory"));
        assert!(results.iter().all(|r| r.tool.original_name != "git_log"));

        assert_eq!(registry.discover("file", 1).len(), 1);
        assert!(registry.discover("   ", 10).is_empty());
    }
}
