//! Aggregated metric shapes produced by the monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reduced view of a latency reservoir
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
}

impl LatencyStats {
    /// Reduce samples; `None` when there are none.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            avg: sum / count as f64,
            p95: percentile(&sorted, 0.95),
        })
    }
}

/// Nearest-rank percentile over already sorted samples
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// A recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Cross-server aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub server_count: usize,
    pub avg_connection_time_ms: f64,
    pub max_connection_time_ms: f64,
    pub total_tool_calls: usize,
    pub avg_tool_latency_ms: f64,
    pub p95_tool_latency_ms: f64,
    pub total_errors: u64,
    /// Errors per recorded tool call; zero when nothing was called
    pub error_rate: f64,
}

impl PerformanceSummary {
    /// The metrics a baseline can be compared against
    pub(crate) fn comparable(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("avgConnectionTime".to_string(), self.avg_connection_time_ms),
            ("avgToolLatency".to_string(), self.avg_tool_latency_ms),
            ("p95ToolLatency".to_string(), self.p95_tool_latency_ms),
            ("errorRate".to_string(), self.error_rate),
        ])
    }
}

/// Direction of change against a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Better,
    Worse,
}

/// One metric against its baseline value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
    pub verdict: Verdict,
}

impl BaselineComparison {
    pub(crate) fn new(baseline: f64, current: f64) -> Self {
        // every tracked metric is lower-is-better
        let verdict = if current <= baseline {
            Verdict::Better
        } else {
            Verdict::Worse
        };
        Self {
            baseline,
            current,
            delta: current - baseline,
            verdict,
        }
    }
}

/// Outcome of a single acceptance threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub threshold: f64,
    pub actual: f64,
    pub passed: bool,
}

/// Proof-of-concept acceptance thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PocEvaluation {
    /// Average connection time must not exceed 1000 ms
    pub connection_time: CriterionResult,
    /// Average tool latency must stay below 100 ms
    pub tool_latency: CriterionResult,
    /// Error rate must stay below 1 %
    pub error_rate: CriterionResult,
    pub passed: bool,
}

pub(crate) const MAX_CONNECTION_TIME_MS: f64 = 1000.0;
pub(crate) const MAX_TOOL_LATENCY_MS: f64 = 100.0;
pub(crate) const MAX_ERROR_RATE: f64 = 0.01;

impl PocEvaluation {
    pub(crate) fn from_summary(summary: &PerformanceSummary) -> Self {
        let connection_time = CriterionResult {
            threshold: MAX_CONNECTION_TIME_MS,
            actual: summary.avg_connection_time_ms,
            passed: summary.avg_connection_time_ms <= MAX_CONNECTION_TIME_MS,
        };
        let tool_latency = CriterionResult {
            threshold: MAX_TOOL_LATENCY_MS,
            actual: summary.avg_tool_latency_ms,
            passed: summary.avg_tool_latency_ms < MAX_TOOL_LATENCY_MS,
        };
        let error_rate = CriterionResult {
            threshold: MAX_ERROR_RATE,
            actual: summary.error_rate,
            passed: summary.error_rate < MAX_ERROR_RATE,
        };
        Self {
            passed: connection_time.passed && tool_latency.passed && error_rate.passed,
            connection_time,
            tool_latency,
            error_rate,
        }
    }
}

/// Serializable snapshot of everything the monitor holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExport {
    pub connection_times: BTreeMap<String, f64>,
    /// Keyed by `server:tool`
    pub tool_latencies: BTreeMap<String, LatencyStats>,
    pub error_counts: BTreeMap<String, u64>,
    pub timestamp: DateTime<Utc>,
}
