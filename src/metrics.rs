//! Relay metrics.

use eyre::Context;
use metrics::Counter;
use metrics_derive::Metrics;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Queue activity.
#[derive(Metrics)]
#[metrics(scope = "queue")]
pub struct QueueMetrics {
    /// Messages accepted into a queue.
    pub queued: Counter,
    /// Messages handed to a processor.
    pub processed: Counter,
    /// Messages dropped after exhausting retries.
    pub dropped: Counter,
}

/// Bundle transaction outcomes.
#[derive(Metrics)]
#[metrics(scope = "transactions")]
pub struct TransactionMetrics {
    /// Bundles submitted to the node.
    pub sent: Counter,
    /// Bundles rejected by the node.
    pub failed: Counter,
}

/// Indexer throughput.
#[derive(Metrics)]
#[metrics(scope = "indexer")]
pub struct IndexerMetrics {
    /// Logs decoded and stored.
    pub logs_indexed: Counter,
    /// Logs skipped because decoding failed.
    pub decode_failures: Counter,
}

/// Installs the Prometheus recorder and returns the render handle.
pub fn build_exporter() -> eyre::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install metrics recorder")
}
