//! Bounded in-memory audit log of policy decisions

use super::classify::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

/// Default number of retained entries
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

const PARAMS_SUMMARY_LIMIT: usize = 200;

/// Terminal outcome of a validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    Allowed,
    Denied,
}

/// One audited decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub decision: AuditDecision,
    pub server_name: String,
    pub tool_name: String,
    pub params_summary: String,
    pub details: String,
    pub risk_level: RiskLevel,
}

impl AuditEntry {
    pub(crate) fn new(
        decision: AuditDecision,
        server: &str,
        tool: &str,
        params: &Value,
        details: impl Into<String>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            decision,
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            params_summary: summarize(params),
            details: details.into(),
            risk_level,
        }
    }
}

fn summarize(params: &Value) -> String {
    let full = params.to_string();
    if full.chars().count() <= PARAMS_SUMMARY_LIMIT {
        return full;
    }
    let mut short: String = full.chars().take(PARAMS_SUMMARY_LIMIT).collect();
    short.push_str("...");
    short
}

/// Selects audit entries; every set field must match
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub server_name: Option<String>,
    pub tool_name: Option<String>,
    pub decision: Option<AuditDecision>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest N matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server_name = Some(server.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }

    pub fn decision(mut self, decision: AuditDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        self.server_name
            .as_ref()
            .is_none_or(|s| *s == entry.server_name)
            && self.tool_name.as_ref().is_none_or(|t| *t == entry.tool_name)
            && self.decision.is_none_or(|d| d == entry.decision)
            && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}

/// Counts over the retained entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub by_risk_level: BTreeMap<RiskLevel, usize>,
}

/// Append-only ring; the oldest entry is evicted when full
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY)),
            capacity,
        }
    }

    pub fn record(&mut self, entry: AuditEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Matching entries, oldest first
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let matching: Vec<&AuditEntry> = self.entries.iter().filter(|e| filter.matches(e)).collect();
        let skip = filter
            .limit
            .map(|limit| matching.len().saturating_sub(limit))
            .unwrap_or(0);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> AuditStatistics {
        let mut stats = AuditStatistics {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match entry.decision {
                AuditDecision::Allowed => stats.allowed += 1,
                AuditDecision::Denied => stats.denied += 1,
            }
            *stats.by_risk_level.entry(entry.risk_level).or_insert(0) += 1;
        }
        stats
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
