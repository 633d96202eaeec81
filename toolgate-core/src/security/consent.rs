//! Human consent: prompts, answers and remembered decisions

use super::classify::{OperationType, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

/// A human's answer to a consent prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentChoice {
    /// Allow this one call
    Allow,
    /// Deny this one call
    Deny,
    /// Allow and remember for matching calls
    AlwaysAllow,
    /// Deny and remember for matching calls
    AlwaysDeny,
}

impl ConsentChoice {
    pub fn allows(&self) -> bool {
        matches!(self, ConsentChoice::Allow | ConsentChoice::AlwaysAllow)
    }

    /// The decision to cache, for the "always" answers only
    pub fn remembered(&self) -> Option<CachedDecision> {
        match self {
            ConsentChoice::AlwaysAllow => Some(CachedDecision::AlwaysAllow),
            ConsentChoice::AlwaysDeny => Some(CachedDecision::AlwaysDeny),
            _ => None,
        }
    }
}

impl std::str::FromStr for ConsentChoice {
    type Err = crate::error::ToolgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "y" | "yes" => Ok(ConsentChoice::Allow),
            "deny" | "n" | "no" => Ok(ConsentChoice::Deny),
            "always_allow" | "always" | "a" => Ok(ConsentChoice::AlwaysAllow),
            "always_deny" | "never" | "d" => Ok(ConsentChoice::AlwaysDeny),
            other => Err(crate::error::ToolgateError::Other(format!(
                "Unknown consent choice: {}",
                other
            ))),
        }
    }
}

/// A remembered "always" answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedDecision {
    AlwaysAllow,
    AlwaysDeny,
}

/// Cache entry keyed by call fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentRecord {
    pub decision: CachedDecision,
    pub timestamp: DateTime<Utc>,
}

/// Published to consent consumers when a call needs a human answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequest {
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub params: Value,
    pub risk_level: RiskLevel,
    pub operation: OperationType,
    pub created_at: DateTime<Utc>,
}

/// How a pending request was resolved
#[derive(Debug)]
pub(crate) enum ConsentOutcome {
    Answered(ConsentChoice),
    Cancelled,
}

/// Bookkeeping for a request awaiting an answer
#[derive(Debug)]
pub(crate) struct PendingConsent {
    pub request: ConsentRequest,
    pub cache_key: String,
    pub respond: oneshot::Sender<ConsentOutcome>,
}

/// Stable key for remembered decisions.
///
/// Two calls share a key when they target the same server and tool, have
/// the same operation type and touch the same paths and command text.
pub fn fingerprint(
    server: &str,
    tool: &str,
    operation: OperationType,
    paths: &[String],
    params: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server.as_bytes());
    hasher.update([0u8]);
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.as_str().as_bytes());
    for path in paths {
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
    }
    for key in ["command", "cmd", "script", "query", "sql", "statement"] {
        if let Some(text) = params.get(key).and_then(Value::as_str) {
            hasher.update([1u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(text.trim().as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
