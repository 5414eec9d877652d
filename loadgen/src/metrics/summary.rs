//! Run-level summary, derived on demand from recorded checks and samples

use crate::scheduler::SchedulerReport;
use crate::session::{PreparationReport, ProvisioningReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSummary {
    pub passes: u64,
    pub fails: u64,
    pub pass_rate: f64,
}

impl CheckSummary {
    pub fn new(passes: u64, fails: u64) -> Self {
        let total = passes + fails;
        let pass_rate = if total == 0 {
            0.0
        } else {
            passes as f64 / total as f64
        };
        Self {
            passes,
            fails,
            pass_rate,
        }
    }
}

/// Latency distribution for one metric, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            avg: sum / count as f64,
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

/// Nearest-rank percentile (0-100) over sorted, non-empty samples
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Aggregated checks and latencies
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub iterations: u64,
    pub total_passes: u64,
    pub total_fails: u64,
    /// `None` when no check was recorded
    pub pass_rate: Option<f64>,
    pub checks: BTreeMap<String, CheckSummary>,
    pub latencies: BTreeMap<String, LatencySummary>,
}

impl MetricsSummary {
    pub fn new(
        checks: BTreeMap<String, CheckSummary>,
        latencies: BTreeMap<String, LatencySummary>,
        iterations: u64,
    ) -> Self {
        let total_passes = checks.values().map(|c| c.passes).sum();
        let total_fails = checks.values().map(|c| c.fails).sum();
        let total = total_passes + total_fails;
        let pass_rate = (total > 0).then(|| total_passes as f64 / total as f64);
        Self {
            iterations,
            total_passes,
            total_fails,
            pass_rate,
            checks,
            latencies,
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckSummary> {
        self.checks.get(name)
    }

    pub fn latency(&self, metric: &str) -> Option<&LatencySummary> {
        self.latencies.get(metric)
    }
}

/// Everything a run produced, exportable as JSON
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub provisioning: ProvisioningReport,
    pub preparation: Option<PreparationReport>,
    pub scheduler: SchedulerReport,
    #[serde(flatten)]
    pub metrics: MetricsSummary,
}

impl RunSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
