//! Operation and risk classification
//!
//! A tool call is classified from its name first (`read_file`,
//! `deleteBranch`, `run_command`) and then from the shape of its
//! parameters: a SQL statement or a shell command can make an innocent
//! looking tool far more dangerous than its name suggests.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a tool call does to the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Read,
    Write,
    Delete,
    Execute,
    Unknown,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::Write => "write",
            OperationType::Delete => "delete",
            OperationType::Execute => "execute",
            OperationType::Unknown => "unknown",
        }
    }

    /// Severity rank used when name and parameters disagree
    fn rank(&self) -> u8 {
        match self {
            OperationType::Read => 0,
            OperationType::Write => 1,
            OperationType::Unknown | OperationType::Execute => 2,
            OperationType::Delete => 3,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much damage an operation can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of classifying one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub operation: OperationType,
    /// Irreversible beyond a plain delete (recursive removal, DROP, TRUNCATE)
    pub destructive: bool,
}

impl Classification {
    pub fn risk_level(&self) -> RiskLevel {
        if self.destructive {
            return RiskLevel::Critical;
        }
        match self.operation {
            OperationType::Read => RiskLevel::Low,
            OperationType::Write | OperationType::Execute | OperationType::Unknown => {
                RiskLevel::High
            }
            OperationType::Delete => RiskLevel::Critical,
        }
    }
}

const DELETE_WORDS: &[&str] = &[
    "delete", "remove", "rm", "rmdir", "unlink", "drop", "truncate", "purge", "destroy", "erase",
    "wipe",
];

const EXECUTE_WORDS: &[&str] = &[
    "exec", "execute", "run", "shell", "command", "cmd", "spawn", "eval", "invoke", "bash", "sh",
    "script", "terminal",
];

const WRITE_WORDS: &[&str] = &[
    "write", "create", "update", "edit", "modify", "insert", "put", "set", "save", "move",
    "rename", "copy", "append", "patch", "upload", "mkdir", "commit", "push", "add", "merge",
    "checkout", "reset", "apply", "replace", "store", "post",
];

const READ_WORDS: &[&str] = &[
    "read", "get", "list", "search", "find", "query", "fetch", "show", "view", "describe",
    "stat", "info", "cat", "head", "tail", "grep", "ls", "tree", "select", "status", "log",
    "diff", "open", "load", "browse", "lookup", "count", "inspect",
];

static CAMEL_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid regex"));

static SQL_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:--[^\n]*\n\s*)*([A-Za-z]+)").expect("valid regex"));

static RECURSIVE_RM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\brm\s+-[a-zA-Z]*[rR]|\bmkfs\b|\bdd\s+if=").expect("valid regex"));

/// Split a tool name into lowercase words: `readFile`, `read-file` and
/// `read_file` all become `["read", "file"]`.
fn name_words(name: &str) -> Vec<String> {
    let spaced = CAMEL_BOUNDARY.replace_all(name, "${1}_${2}");
    spaced
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect()
}

fn classify_name(tool: &str) -> OperationType {
    let words = name_words(tool);
    let has = |list: &[&str]| words.iter().any(|w| list.contains(&w.as_str()));

    if has(DELETE_WORDS) {
        OperationType::Delete
    } else if has(EXECUTE_WORDS) {
        OperationType::Execute
    } else if has(WRITE_WORDS) {
        OperationType::Write
    } else if has(READ_WORDS) {
        OperationType::Read
    } else {
        OperationType::Unknown
    }
}

fn classify_sql(statement: &str) -> Option<Classification> {
    let verb = SQL_VERB.captures(statement)?.get(1)?.as_str().to_ascii_uppercase();
    let (operation, destructive) = match verb.as_str() {
        "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "PRAGMA" | "WITH" | "VALUES" => {
            (OperationType::Read, false)
        }
        "INSERT" | "UPDATE" | "REPLACE" | "CREATE" | "ALTER" | "MERGE" | "UPSERT" | "GRANT"
        | "REVOKE" => (OperationType::Write, false),
        "DELETE" => (OperationType::Delete, false),
        "DROP" | "TRUNCATE" => (OperationType::Delete, true),
        _ => return None,
    };
    Some(Classification {
        operation,
        destructive,
    })
}

fn string_param<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| params.get(*k).and_then(Value::as_str))
}

fn classify_params(params: &Value) -> Option<Classification> {
    if let Some(statement) = string_param(params, &["query", "sql", "statement"]) {
        if let Some(sql) = classify_sql(statement) {
            return Some(sql);
        }
    }

    if let Some(command) = string_param(params, &["command", "cmd", "script"]) {
        return Some(Classification {
            operation: OperationType::Execute,
            destructive: RECURSIVE_RM.is_match(command),
        });
    }
    None
}

/// Classify a call by tool name and parameter shape.
///
/// The name is checked for delete, execute, write and read words in that
/// order. Parameters can only make the result more severe, except that a
/// recognised parameter shape replaces an unknown name.
pub fn classify(tool: &str, params: &Value) -> Classification {
    let by_name = Classification {
        operation: classify_name(tool),
        destructive: false,
    };

    let mut result = match classify_params(params) {
        Some(by_params) if by_name.operation == OperationType::Unknown => by_params,
        Some(by_params) if by_params.operation.rank() > by_name.operation.rank() => by_params,
        Some(by_params) => Classification {
            operation: by_name.operation,
            destructive: by_params.destructive,
        },
        None => by_name,
    };

    if result.operation == OperationType::Delete
        && params.get("recursive").and_then(Value::as_bool) == Some(true)
    {
        result.destructive = true;
    }
    result
}
