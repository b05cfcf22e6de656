//! Prometheus metrics infrastructure
//!
//! Exporter setup plus the metric set recorded by the funding service.
//! Without an installed recorder every call is a no-op.

use metrics::{counter, histogram, Counter, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP listener exposing `/metrics` on the given port. Must be
/// called from within a tokio runtime.
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Metrics for allocation runs
///
/// # Metrics
///
/// * `funding_matching_runs_total{subject}` - matching runs by subject kind
/// * `funding_transfers_total` - nonzero transfers
/// * `funding_allocated_amount_total` - sum of all transfers
/// * `funding_entities_closed_total{kind}` - entities that became fully invested
/// * `funding_commit_conflicts_total` - commits lost to a concurrent writer
/// * `funding_matching_duration_seconds` - read-match-commit latency
#[derive(Clone)]
pub struct FundingMetrics {
    transfers_total: Counter,
    allocated_amount_total: Counter,
    commit_conflicts_total: Counter,
    matching_duration: Histogram,
}

impl FundingMetrics {
    pub fn new() -> Self {
        Self {
            transfers_total: counter!("funding_transfers_total"),
            allocated_amount_total: counter!("funding_allocated_amount_total"),
            commit_conflicts_total: counter!("funding_commit_conflicts_total"),
            matching_duration: histogram!("funding_matching_duration_seconds"),
        }
    }

    /// Record one committed matching run
    pub fn record_run(&self, subject_kind: &'static str, duration: Duration, transfers: u64, amount: u64) {
        counter!("funding_matching_runs_total", "subject" => subject_kind).increment(1);
        self.transfers_total.increment(transfers);
        self.allocated_amount_total.increment(amount);
        self.matching_duration.record(duration.as_secs_f64());
    }

    /// Record entities of `kind` closed by a run or an edit
    pub fn record_closed(&self, kind: &'static str, count: u64) {
        if count > 0 {
            counter!("funding_entities_closed_total", "kind" => kind).increment(count);
        }
    }

    /// Record a commit that lost an optimistic check
    pub fn record_conflict(&self) {
        self.commit_conflicts_total.increment(1);
    }
}

impl Default for FundingMetrics {
    fn default() -> Self {
        Self::new()
    }
}
