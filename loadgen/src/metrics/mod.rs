//! Check and latency collection

pub mod aggregator;
pub mod summary;

pub use aggregator::{CheckResult, LatencySample, MetricsAggregator};
pub use summary::{CheckSummary, LatencySummary, MetricsSummary, RunSummary};
