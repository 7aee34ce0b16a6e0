//! Bookkeeping kept next to the orchestrator: a bounded audit log, bounded
//! per-key performance series, and the analytics derived from them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use mplp_core::types::{WorkflowResult, WorkflowStatus};

/// Audit entries kept before the oldest is dropped.
pub const AUDIT_LOG_CAPACITY: usize = 1000;
/// Samples kept per metric key.
pub const METRIC_SERIES_CAPACITY: usize = 100;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Append-only, bounded audit trail.
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn record(&self, event: impl Into<String>, details: serde_json::Value) {
        let mut entries = lock(&self.entries);
        entries.push_back(AuditEvent {
            event: event.into(),
            details,
            timestamp: Utc::now(),
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let entries = lock(&self.entries);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(AUDIT_LOG_CAPACITY)
    }
}

/// One timed outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(duration_ms: u64, success: bool) -> Self {
        Self {
            duration_ms,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate over a metric series.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub total_executions: usize,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Bounded sample series keyed by name (`agent_<id>`, `workflow_<id>`).
#[derive(Debug)]
pub struct MetricsStore {
    series: Mutex<HashMap<String, VecDeque<MetricSample>>>,
    capacity: usize,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn record(&self, key: impl Into<String>, sample: MetricSample) {
        let mut series = lock(&self.series);
        let samples = series.entry(key.into()).or_default();
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn samples(&self, key: &str) -> Vec<MetricSample> {
        lock(&self.series)
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every series, keyed by name.
    pub fn snapshot(&self) -> HashMap<String, Vec<MetricSample>> {
        lock(&self.series)
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }

    /// None when the key has no samples.
    pub fn stats(&self, key: &str) -> Option<PerformanceStats> {
        let series = lock(&self.series);
        let samples = series.get(key).filter(|s| !s.is_empty())?;
        let total = samples.len();
        let successes = samples.iter().filter(|s| s.success).count();
        let duration: u64 = samples.iter().map(|s| s.duration_ms).sum();
        Some(PerformanceStats {
            total_executions: total,
            average_duration_ms: duration as f64 / total as f64,
            success_rate: successes as f64 / total as f64,
            last_execution: samples.back().map(|s| s.timestamp),
        })
    }

    /// Mean duration of samples newer than `since`, or 0.0.
    pub fn average_duration_since(&self, since: DateTime<Utc>) -> f64 {
        let series = lock(&self.series);
        let recent: Vec<u64> = series
            .values()
            .flatten()
            .filter(|s| s.timestamp > since)
            .map(|s| s.duration_ms)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().sum::<u64>() as f64 / recent.len() as f64
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(METRIC_SERIES_CAPACITY)
    }
}

/// Outcome statistics over a set of executions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAnalytics {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub cancelled_executions: usize,
    pub success_rate: f64,
    /// Mean duration of successful executions.
    pub average_duration_ms: f64,
    /// Error message -> number of failed executions with it.
    pub failure_reasons: BTreeMap<String, usize>,
    pub last_execution: Option<DateTime<Utc>>,
}

impl WorkflowAnalytics {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a WorkflowResult>) -> Self {
        let mut analytics = Self::default();
        let mut durations = Vec::new();

        for result in results {
            analytics.total_executions += 1;
            match result.status {
                WorkflowStatus::Completed => {
                    analytics.successful_executions += 1;
                    durations.extend(result.duration_ms);
                }
                WorkflowStatus::Failed => {
                    analytics.failed_executions += 1;
                    let reason = result.error.clone().unwrap_or_else(|| "Unknown error".into());
                    *analytics.failure_reasons.entry(reason).or_default() += 1;
                }
                WorkflowStatus::Cancelled => analytics.cancelled_executions += 1,
                _ => {}
            }
            analytics.last_execution = analytics.last_execution.max(Some(result.start_time));
        }

        if analytics.total_executions > 0 {
            analytics.success_rate =
                analytics.successful_executions as f64 / analytics.total_executions as f64;
        }
        if !durations.is_empty() {
            analytics.average_duration_ms =
                durations.iter().sum::<u64>() as f64 / durations.len() as f64;
        }
        analytics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub agents: usize,
    pub workflows: usize,
    pub templates: usize,
    pub total_executions: usize,
    pub active_executions: usize,
    pub recent_executions: usize,
    pub recent_success_rate: f64,
    pub average_response_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Window used for the "recent" figures in [`SystemHealth`].
pub fn recent_window() -> Duration {
    Duration::hours(1)
}
