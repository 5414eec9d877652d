//! Concurrent check and latency sink
//!
//! One writer per active virtual user. Check tallies are atomic counters and latency
//! samples are appended under a per-metric shard lock, so no write is lost.
//! Every record is mirrored into the `metrics` facade for live export.

use super::summary::{CheckSummary, LatencySummary, MetricsSummary};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A named boolean assertion outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
            timestamp: Utc::now(),
        }
    }

    pub fn pass(name: impl Into<String>) -> Self {
        Self::new(name, true)
    }

    pub fn fail(name: impl Into<String>) -> Self {
        Self::new(name, false)
    }
}

/// One timed observation under a metric name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    pub metric: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl LatencySample {
    pub fn new(metric: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            metric: metric.into(),
            duration_ms,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct CheckTally {
    passes: AtomicU64,
    fails: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    checks: DashMap<String, CheckTally>,
    latencies: DashMap<String, Vec<f64>>,
    iterations: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&self, check: &CheckResult) {
        let result = if check.passed { "pass" } else { "fail" };
        counter!("chatload_checks_total", "check" => check.name.clone(), "result" => result)
            .increment(1);

        // Fast path avoids allocating the key when the check already exists
        if let Some(tally) = self.checks.get(&check.name) {
            tally.add(check.passed);
            return;
        }
        self.checks
            .entry(check.name.clone())
            .or_default()
            .add(check.passed);
    }

    pub fn record_sample(&self, sample: &LatencySample) {
        histogram!("chatload_latency_ms", "metric" => sample.metric.clone())
            .record(sample.duration_ms);

        if let Some(mut samples) = self.latencies.get_mut(&sample.metric) {
            samples.push(sample.duration_ms);
            return;
        }
        self.latencies
            .entry(sample.metric.clone())
            .or_default()
            .push(sample.duration_ms);
    }

    /// Count one executed scenario iteration
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Snapshot of everything recorded so far. Safe to call while writers are active.
    pub fn summarize(&self) -> MetricsSummary {
        let checks: BTreeMap<String, CheckSummary> = self
            .checks
            .iter()
            .map(|entry| {
                let tally = entry.value();
                (
                    entry.key().clone(),
                    CheckSummary::new(
                        tally.passes.load(Ordering::Relaxed),
                        tally.fails.load(Ordering::Relaxed),
                    ),
                )
            })
            .collect();

        let latencies: BTreeMap<String, LatencySummary> = self
            .latencies
            .iter()
            .filter_map(|entry| {
                LatencySummary::from_samples(entry.value()).map(|s| (entry.key().clone(), s))
            })
            .collect();

        MetricsSummary::new(checks, latencies, self.iterations())
    }
}

impl CheckTally {
    fn add(&self, passed: bool) {
        let counter = if passed { &self.passes } else { &self.fails };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_check_tallies() {
        let agg = MetricsAggregator::new();
        agg.record_check(&CheckResult::pass("message sent successfully"));
        agg.record_check(&CheckResult::pass("message sent successfully"));
        agg.record_check(&CheckResult::fail("message sent successfully"));
        agg.record_check(&CheckResult::fail("session available"));

        let summary = agg.summarize();
        let sent = &summary.checks["message sent successfully"];
        assert_eq!((sent.passes, sent.fails), (2, 1));
        assert!((sent.pass_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.checks["session available"].pass_rate, 0.0);
        assert_eq!((summary.total_passes, summary.total_fails), (2, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recording_loses_nothing() {
        let agg = Arc::new(MetricsAggregator::new());

        let handles: Vec<_> = (0..100)
            .map(|worker| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    for i in 0..100 {
                        let duration = (worker * 100 + i) as f64;
                        agg.record_sample(&LatencySample::new("message_send_time", duration));
                        agg.record_check(&CheckResult::new("ok", i % 2 == 0));
                        if i % 10 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let summary = agg.summarize();
        let latency = &summary.latencies["message_send_time"];
        assert_eq!(latency.count, 10_000);
        assert_eq!(latency.min, 0.0);
        assert_eq!(latency.max, 9_999.0);
        let ok = &summary.checks["ok"];
        assert_eq!(ok.passes + ok.fails, 10_000);
        assert_eq!(ok.passes, 5_000);
    }

    #[test]
    fn test_summarize_while_empty() {
        let summary = MetricsAggregator::new().summarize();
        assert!(summary.checks.is_empty());
        assert!(summary.latencies.is_empty());
        assert_eq!(summary.pass_rate, None);
    }
}
