//! Performance monitoring for tool-server traffic
//!
//! The monitor is a pure aggregation sink. The client manager feeds it
//! connection times, per-tool latencies and errors; readers get reduced
//! statistics, a plain-text report, a baseline comparison and a pass/fail
//! evaluation against fixed latency and availability targets.
//!
//! # Example
//!
//! ```rust,ignore
//! use toolgate_core::monitor::PerformanceMonitor;
//!
//! let monitor = PerformanceMonitor::new();
//! monitor.record_connection_time("filesystem", 120.0).await;
//! monitor.record_tool_latency("filesystem", "read_file", 8.5).await;
//!
//! let evaluation = monitor.evaluate_poc_criteria().await;
//! println!("{}", monitor.get_formatted_report().await);
//! ```

mod stats;


pub use stats::{
    BaselineComparison, CriterionResult, ErrorRecord, LatencyStats, MetricsExport,
    PerformanceSummary, PocEvaluation, Verdict,
};

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How many recent errors are retained
pub const RECENT_ERROR_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct MonitorState {
    /// Latest connection time per server
    connection_times: HashMap<String, f64>,
    /// Raw samples per (server, tool)
    tool_latencies: HashMap<(String, String), Vec<f64>>,
    error_counts: HashMap<String, u64>,
    recent_errors: VecDeque<ErrorRecord>,
    baseline: HashMap<String, f64>,
}

/// Aggregates connection times, tool latencies and errors
#[derive(Debug, Clone, Default)]
pub struct PerformanceMonitor {
    state: Arc<RwLock<MonitorState>>,
}

impl PerformanceMonitor {
    /// Create an empty monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a connection took; a reconnect overwrites the old value.
    pub async fn record_connection_time(&self, server: &str, ms: f64) {
        let mut state = self.state.write().await;
        state.connection_times.insert(server.to_string(), ms);
    }

    /// Append one latency sample for a tool.
    pub async fn record_tool_latency(&self, server: &str, tool: &str, ms: f64) {
        let mut state = self.state.write().await;
        state
            .tool_latencies
            .entry((server.to_string(), tool.to_string()))
            .or_default()
            .push(ms);
    }

    /// Count an error against a server and remember it in the recent ring.
    pub async fn record_error(&self, server: &str, tool: Option<&str>, error: &str) {
        let mut state = self.state.write().await;
        *state.error_counts.entry(server.to_string()).or_insert(0) += 1;

        if state.recent_errors.len() >= RECENT_ERROR_CAPACITY {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(ErrorRecord {
            server_name: server.to_string(),
            tool_name: tool.map(str::to_string),
            message: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Latest connection time per server
    pub async fn get_connection_times(&self) -> BTreeMap<String, f64> {
        let state = self.state.read().await;
        state
            .connection_times
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Reduced latency statistics keyed by `server:tool`
    pub async fn get_tool_latencies(&self) -> BTreeMap<String, LatencyStats> {
        let state = self.state.read().await;
        state
            .tool_latencies
            .iter()
            .filter_map(|((server, tool), samples)| {
                LatencyStats::from_samples(samples).map(|s| (format!("{}:{}", server, tool), s))
            })
            .collect()
    }

    /// Error counter per server
    pub async fn get_error_counts(&self) -> BTreeMap<String, u64> {
        let state = self.state.read().await;
        state
            .error_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Most recent errors, oldest first
    pub async fn recent_errors(&self) -> Vec<ErrorRecord> {
        let state = self.state.read().await;
        state.recent_errors.iter().cloned().collect()
    }

    /// Aggregate across all servers and tools.
    pub async fn get_summary(&self) -> PerformanceSummary {
        let state = self.state.read().await;

        let connection_times: Vec<f64> = state.connection_times.values().copied().collect();
        let avg_connection_time_ms = mean(&connection_times);
        let max_connection_time_ms = connection_times.iter().copied().fold(0.0, f64::max);

        let mut all_samples: Vec<f64> = state.tool_latencies.values().flatten().copied().collect();
        all_samples.sort_by(|a, b| a.total_cmp(b));
        let total_tool_calls = all_samples.len();

        let total_errors: u64 = state.error_counts.values().sum();
        let error_rate = if total_tool_calls == 0 {
            0.0
        } else {
            total_errors as f64 / total_tool_calls as f64
        };

        let mut servers: Vec<&String> = state.connection_times.keys().collect();
        servers.extend(state.tool_latencies.keys().map(|(server, _)| server));
        servers.sort();
        servers.dedup();

        PerformanceSummary {
            server_count: servers.len(),
            avg_connection_time_ms,
            max_connection_time_ms,
            total_tool_calls,
            avg_tool_latency_ms: mean(&all_samples),
            p95_tool_latency_ms: stats::percentile(&all_samples, 0.95),
            total_errors,
            error_rate,
        }
    }

    /// Human-readable multi-line report
    pub async fn get_formatted_report(&self) -> String {
        let summary = self.get_summary().await;
        let connection_times = self.get_connection_times().await;
        let latencies = self.get_tool_latencies().await;
        let errors = self.get_error_counts().await;
        let evaluation = PocEvaluation::from_summary(&summary);

        let mut out = String::new();
        let _ = writeln!(out, "=== Tool Integration Performance Report ===");
        let _ = writeln!(out, "Servers: {}", summary.server_count);
        let _ = writeln!(
            out,
            "Connection time: avg {:.1} ms, max {:.1} ms",
            summary.avg_connection_time_ms, summary.max_connection_time_ms
        );
        for (server, ms) in &connection_times {
            let _ = writeln!(out, "  {:<24} {:>8.1} ms", server, ms);
        }

        let _ = writeln!(
            out,
            "Tool calls: {} (avg {:.1} ms, p95 {:.1} ms)",
            summary.total_tool_calls, summary.avg_tool_latency_ms, summary.p95_tool_latency_ms
        );
        for (key, s) in &latencies {
            let _ = writeln!(
                out,
                "  {:<32} n={:<5} min={:.1} avg={:.1} p95={:.1} max={:.1}",
                key, s.count, s.min, s.avg, s.p95, s.max
            );
        }

        let _ = writeln!(
            out,
            "Errors: {} (rate {:.2}%)",
            summary.total_errors,
            summary.error_rate * 100.0
        );
        for (server, count) in &errors {
            let _ = writeln!(out, "  {:<24} {}", server, count);
        }

        let mark = |passed: bool| if passed { "PASS" } else { "FAIL" };
        let _ = writeln!(out, "Targets:");
        let _ = writeln!(
            out,
            "  connection <= {:.0} ms: {}",
            evaluation.connection_time.threshold,
            mark(evaluation.connection_time.passed)
        );
        let _ = writeln!(
            out,
            "  tool latency < {:.0} ms: {}",
            evaluation.tool_latency.threshold,
            mark(evaluation.tool_latency.passed)
        );
        let _ = writeln!(
            out,
            "  error rate < {:.0}%: {}",
            evaluation.error_rate.threshold * 100.0,
            mark(evaluation.error_rate.passed)
        );
        out
    }

    /// Replace the stored baseline values.
    ///
    /// Recognised keys: `avgConnectionTime`, `avgToolLatency`,
    /// `p95ToolLatency`, `errorRate`.
    pub async fn set_baseline(&self, values: HashMap<String, f64>) {
        let mut state = self.state.write().await;
        state.baseline = values;
    }

    /// Compare current aggregates with the baseline; unknown keys are skipped.
    pub async fn compare_to_baseline(&self) -> BTreeMap<String, BaselineComparison> {
        let current = self.get_summary().await.comparable();
        let state = self.state.read().await;
        state
            .baseline
            .iter()
            .filter_map(|(metric, baseline)| {
                current
                    .get(metric)
                    .map(|value| (metric.clone(), BaselineComparison::new(*baseline, *value)))
            })
            .collect()
    }

    /// Check the fixed acceptance thresholds.
    pub async fn evaluate_poc_criteria(&self) -> PocEvaluation {
        PocEvaluation::from_summary(&self.get_summary().await)
    }

    /// Drop every sample, counter and the baseline.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = MonitorState::default();
    }

    /// Snapshot for serialization
    pub async fn export_metrics(&self) -> MetricsExport {
        MetricsExport {
            connection_times: self.get_connection_times().await,
            tool_latencies: self.get_tool_latencies().await,
            error_counts: self.get_error_counts().await,
            timestamp: Utc::now(),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
