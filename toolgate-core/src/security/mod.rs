//! Security policy for tool calls
//!
//! Every call passes through [`SecurityPolicy::validate_operation`] before
//! any transport is touched. The checks run in a fixed order:
//!
//! 1. globally forbidden path fragments (never overridable)
//! 2. the server's allow/forbid path prefixes
//! 3. operation classification by tool name and parameter shape
//! 4. the read-only gate
//! 5. risk scoring, remembered consent, and finally a human prompt
//!
//! Prompts are published on a broadcast channel; a consumer answers with
//! [`SecurityPolicy::handle_consent_response`]. Unanswered prompts deny
//! after the consent timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use toolgate_core::security::{SecurityPolicy, PermissionProfile, ConsentChoice};
//!
//! let policy = Arc::new(SecurityPolicy::new(&SecurityConfig::default()));
//! let mut prompts = policy.consent_requests();
//!
//! tokio::spawn({
//!     let policy = policy.clone();
//!     async move {
//!         while let Ok(request) = prompts.recv().await {
//!             policy.handle_consent_response(&request.request_id, ConsentChoice::Allow).await.ok();
//!         }
//!     }
//! });
//!
//! let verdict = policy.validate_operation("fs", "write_file", &params).await?;
//! ```

mod audit;
mod classify;
mod consent;
mod paths;

#[cfg(test)]
mod tests;

pub use audit::{
    AuditDecision, AuditEntry, AuditFilter, AuditLog, AuditStatistics, DEFAULT_AUDIT_CAPACITY,
};
pub use classify::{Classification, OperationType, RiskLevel, classify};
pub use consent::{CachedDecision, ConsentChoice, ConsentRecord, ConsentRequest, fingerprint};
pub use paths::{GLOBAL_FORBIDDEN_PATHS, extract_paths, normalize_path, prefix_matches};

use crate::config::SecurityConfig;
use crate::error::{Result, ToolgateError};
use chrono::Utc;
use consent::{ConsentOutcome, PendingConsent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tracing::{debug, info, warn};

/// Reason given when a consent prompt goes unanswered
pub const NOT_AUTHORIZED: &str = "Operation not authorized";

const CONSENT_CHANNEL_CAPACITY: usize = 64;

/// Per-server path and consent rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionProfile {
    /// When non-empty, every path must fall under one of these prefixes
    #[serde(default, alias = "allowedPaths", alias = "allowedPathPrefixes")]
    pub allowed_paths: Vec<String>,

    /// No path may fall under any of these prefixes
    #[serde(default, alias = "forbiddenPaths", alias = "forbiddenPathPrefixes")]
    pub forbidden_paths: Vec<String>,

    /// Only read operations are permitted
    #[serde(default, alias = "readOnly")]
    pub read_only: bool,

    /// HIGH-risk calls need a human answer; CRITICAL always does
    #[serde(default = "default_require_consent", alias = "requireConsent")]
    pub require_consent: bool,
}

fn default_require_consent() -> bool {
    true
}

impl Default for PermissionProfile {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            forbidden_paths: Vec::new(),
            read_only: false,
            require_consent: true,
        }
    }
}

impl PermissionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_path(mut self, prefix: impl Into<String>) -> Self {
        self.allowed_paths.push(prefix.into());
        self
    }

    pub fn forbid_path(mut self, prefix: impl Into<String>) -> Self {
        self.forbidden_paths.push(prefix.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn require_consent(mut self, require_consent: bool) -> Self {
        self.require_consent = require_consent;
        self
    }

    fn path_violation(&self, server: &str, path: &str) -> Option<String> {
        if let Some(prefix) = self
            .forbidden_paths
            .iter()
            .find(|prefix| prefix_matches(path, prefix))
        {
            return Some(format!(
                "Path {} is forbidden for server {} ({})",
                path, server, prefix
            ));
        }
        if !self.allowed_paths.is_empty() && paths::escapes_root(path) {
            return Some(format!(
                "Path {} climbs outside the allowed paths for server {}",
                path, server
            ));
        }
        if !self.allowed_paths.is_empty()
            && !self
                .allowed_paths
                .iter()
                .any(|prefix| prefix_matches(path, prefix))
        {
            return Some(format!(
                "Path {} is outside the allowed paths for server {}",
                path, server
            ));
        }
        None
    }
}

/// Verdict for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub risk_level: RiskLevel,
    pub operation: OperationType,
}

impl ValidationResult {
    fn allow(classification: Classification, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
            risk_level: classification.risk_level(),
            operation: classification.operation,
        }
    }

    fn deny(classification: Classification, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            risk_level: classification.risk_level(),
            operation: classification.operation,
        }
    }

    /// The denial reason, or an empty string
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Counters over the policy's current state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatistics {
    pub audit: AuditStatistics,
    pub pending_requests: usize,
    pub cached_decisions: usize,
    pub configured_servers: usize,
}

/// Decides whether tool calls may proceed
pub struct SecurityPolicy {
    global_forbidden: Vec<String>,
    permissions: RwLock<HashMap<String, PermissionProfile>>,
    consent_cache: RwLock<HashMap<String, ConsentRecord>>,
    pending: Mutex<HashMap<String, PendingConsent>>,
    consent_tx: broadcast::Sender<ConsentRequest>,
    audit: RwLock<AuditLog>,
    consent_timeout: Duration,
}

impl std::fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("global_forbidden", &self.global_forbidden.len())
            .field("consent_timeout", &self.consent_timeout)
            .finish()
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

impl SecurityPolicy {
    /// Build a policy from configuration.
    ///
    /// Extra forbidden fragments are appended to the built-in list.
    pub fn new(config: &SecurityConfig) -> Self {
        let mut global_forbidden: Vec<String> =
            GLOBAL_FORBIDDEN_PATHS.iter().map(|s| s.to_string()).collect();
        for extra in &config.extra_forbidden_paths {
            let fragment = normalize_path(extra);
            if !fragment.is_empty() && !global_forbidden.contains(&fragment) {
                global_forbidden.push(fragment);
            }
        }

        let (consent_tx, _) = broadcast::channel(CONSENT_CHANNEL_CAPACITY);
        Self {
            global_forbidden,
            permissions: RwLock::new(
                config
                    .permissions
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            consent_cache: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            consent_tx,
            audit: RwLock::new(AuditLog::new(config.audit_capacity)),
            consent_timeout: config.consent_timeout,
        }
    }

    /// Subscribe to consent prompts.
    ///
    /// Prompts published before subscribing are not replayed; use
    /// [`pending_consent_requests`](Self::pending_consent_requests) to catch up.
    pub fn consent_requests(&self) -> broadcast::Receiver<ConsentRequest> {
        self.consent_tx.subscribe()
    }

    /// Fragments that are denied for every server
    pub fn global_forbidden_paths(&self) -> &[String] {
        &self.global_forbidden
    }

    /// Replace the profile for a server
    pub async fn set_server_permissions(&self, server: &str, profile: PermissionProfile) {
        info!(server = %server, ?profile, "Updated server permissions");
        self.permissions
            .write()
            .await
            .insert(server.to_string(), profile);
    }

    /// Current profile for a server; unknown servers get the default profile
    pub async fn get_server_permissions(&self, server: &str) -> PermissionProfile {
        self.permissions
            .read()
            .await
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    /// Decide whether a call may proceed.
    ///
    /// Returns `Ok` with a verdict for every allow or deny, including a
    /// consent timeout. Fails only when the pending consent request is
    /// cancelled.
    pub async fn validate_operation(
        &self,
        server: &str,
        tool: &str,
        params: &Value,
    ) -> Result<ValidationResult> {
        let touched = extract_paths(params);
        let classification = classify(tool, params);

        for path in &touched {
            if let Some(fragment) = paths::forbidden_fragment(path, &self.global_forbidden) {
                let reason = format!("Access to forbidden path: {} (matches {})", path, fragment);
                return Ok(self
                    .finish(server, tool, params, ValidationResult::deny(classification, reason))
                    .await);
            }
        }

        let profile = self.get_server_permissions(server).await;
        for path in &touched {
            if let Some(reason) = profile.path_violation(server, path) {
                return Ok(self
                    .finish(server, tool, params, ValidationResult::deny(classification, reason))
                    .await);
            }
        }

        if profile.read_only && classification.operation != OperationType::Read {
            let reason = format!(
                "Server {} is read-only; {} operations are not permitted",
                server, classification.operation
            );
            return Ok(self
                .finish(server, tool, params, ValidationResult::deny(classification, reason))
                .await);
        }

        let risk = classification.risk_level();
        if risk == RiskLevel::Low {
            return Ok(self
                .finish(
                    server,
                    tool,
                    params,
                    ValidationResult::allow(classification, "Low-risk operation"),
                )
                .await);
        }
        if risk == RiskLevel::High && !profile.require_consent {
            return Ok(self
                .finish(
                    server,
                    tool,
                    params,
                    ValidationResult::allow(classification, "Consent not required for server"),
                )
                .await);
        }

        let cache_key = fingerprint(server, tool, classification.operation, &touched, params);
        let cached = self.consent_cache.read().await.get(&cache_key).copied();
        if let Some(record) = cached {
            let verdict = match record.decision {
                CachedDecision::AlwaysAllow => {
                    ValidationResult::allow(classification, "Allowed by saved consent decision")
                }
                CachedDecision::AlwaysDeny => {
                    ValidationResult::deny(classification, "Denied by saved consent decision")
                }
            };
            return Ok(self.finish(server, tool, params, verdict).await);
        }

        self.ask_for_consent(server, tool, params, classification, cache_key)
            .await
    }

    async fn ask_for_consent(
        &self,
        server: &str,
        tool: &str,
        params: &Value,
        classification: Classification,
        cache_key: String,
    ) -> Result<ValidationResult> {
        let request = ConsentRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            params: params.clone(),
            risk_level: classification.risk_level(),
            operation: classification.operation,
            created_at: Utc::now(),
        };
        let request_id = request.request_id.clone();

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id.clone(),
            PendingConsent {
                request: request.clone(),
                cache_key,
                respond: tx,
            },
        );

        debug!(
            request_id = %request_id,
            server = %server,
            tool = %tool,
            risk = %request.risk_level,
            "Awaiting consent"
        );
        // no subscribers is fine; pollers use pending_consent_requests()
        let _ = self.consent_tx.send(request);

        let outcome = match tokio::time::timeout(self.consent_timeout, &mut rx).await {
            Ok(received) => Some(received.unwrap_or(ConsentOutcome::Cancelled)),
            Err(_) => {
                let unanswered = self.pending.lock().await.remove(&request_id).is_some();
                if unanswered {
                    None
                } else {
                    // an answer took the request just as the wait elapsed
                    Some(rx.await.unwrap_or(ConsentOutcome::Cancelled))
                }
            }
        };

        match outcome {
            Some(ConsentOutcome::Answered(choice)) => {
                let verdict = if choice.allows() {
                    ValidationResult::allow(classification, "Allowed by user")
                } else {
                    ValidationResult::deny(classification, "Denied by user")
                };
                Ok(self.finish(server, tool, params, verdict).await)
            }
            Some(ConsentOutcome::Cancelled) => {
                self.pending.lock().await.remove(&request_id);
                self.finish(
                    server,
                    tool,
                    params,
                    ValidationResult::deny(classification, "Consent request cancelled"),
                )
                .await;
                Err(ToolgateError::ConsentCancelled(request_id))
            }
            None => {
                warn!(request_id = %request_id, server = %server, tool = %tool, "Consent timed out");
                Ok(self
                    .finish(
                        server,
                        tool,
                        params,
                        ValidationResult::deny(classification, NOT_AUTHORIZED),
                    )
                    .await)
            }
        }
    }

    /// Audit and log a terminal decision.
    async fn finish(
        &self,
        server: &str,
        tool: &str,
        params: &Value,
        verdict: ValidationResult,
    ) -> ValidationResult {
        let decision = if verdict.allowed {
            debug!(server = %server, tool = %tool, risk = %verdict.risk_level, reason = verdict.reason(), "Operation allowed");
            AuditDecision::Allowed
        } else {
            warn!(server = %server, tool = %tool, risk = %verdict.risk_level, reason = verdict.reason(), "Operation denied");
            AuditDecision::Denied
        };
        self.audit.write().await.record(AuditEntry::new(
            decision,
            server,
            tool,
            params,
            verdict.reason(),
            verdict.risk_level,
        ));
        verdict
    }

    /// Answer a pending consent request.
    ///
    /// "Always" answers are remembered before the waiting call resumes.
    pub async fn handle_consent_response(&self, request_id: &str, choice: ConsentChoice) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| {
                ToolgateError::NotFound(format!("Consent request not found: {}", request_id))
            })?;

        if let Some(decision) = choice.remembered() {
            self.consent_cache.write().await.insert(
                pending.cache_key.clone(),
                ConsentRecord {
                    decision,
                    timestamp: Utc::now(),
                },
            );
        }

        info!(
            request_id = %request_id,
            server = %pending.request.server_name,
            tool = %pending.request.tool_name,
            ?choice,
            "Consent answered"
        );
        // the waiter may have timed out in the meantime
        let _ = pending.respond.send(ConsentOutcome::Answered(choice));
        Ok(())
    }

    /// Cancel a pending consent request; the waiting call fails.
    pub async fn cancel_consent_request(&self, request_id: &str) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| {
                ToolgateError::NotFound(format!("Consent request not found: {}", request_id))
            })?;
        info!(request_id = %request_id, "Consent request cancelled");
        let _ = pending.respond.send(ConsentOutcome::Cancelled);
        Ok(())
    }

    /// Requests still waiting for an answer, oldest first
    pub async fn pending_consent_requests(&self) -> Vec<ConsentRequest> {
        let mut requests: Vec<ConsentRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Forget every remembered consent decision
    pub async fn clear_consent_cache(&self) {
        let mut cache = self.consent_cache.write().await;
        info!(cleared = cache.len(), "Cleared consent cache");
        cache.clear();
    }

    /// Audit entries matching the filter, oldest first
    pub async fn get_audit_log(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.read().await.query(filter)
    }

    pub async fn get_statistics(&self) -> SecurityStatistics {
        SecurityStatistics {
            audit: self.audit.read().await.statistics(),
            pending_requests: self.pending.lock().await.len(),
            cached_decisions: self.consent_cache.read().await.len(),
            configured_servers: self.permissions.read().await.len(),
        }
    }
}
