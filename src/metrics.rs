//! Metrics collection for observability
//!
//! Prometheus metrics for the engine hot paths, all labelled with `engine`
//! and `partition`:
//!
//! - `<prefix>_ring_remaining` — ring queue remaining capacity (smaller is
//!   more loaded)
//! - `<prefix>_writer_queue_depth` — async-writer FIFO backlog (reflects
//!   sink pressure)
//! - `<prefix>_persist_batch_seconds` — persist batch latency histogram

use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};

use crate::error::{Error, Result};

const LABELS: &[&str] = &["engine", "partition"];

/// Engine metrics bound to an owned registry.
#[derive(Clone)]
pub struct Metrics {
    /// Ring queue remaining capacity per partition
    pub ring_remaining: IntGaugeVec,

    /// Async-writer FIFO depth per partition
    pub writer_queue_depth: IntGaugeVec,

    /// Persist batch latency per partition
    pub persist_batch_seconds: HistogramVec,

    /// Prometheus registry holding the metrics above
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a collector with `prefix` applied to every metric name.
    ///
    /// An empty prefix falls back to `ledger`; a trailing separator is not
    /// required.
    pub fn new(prefix: &str) -> Result<Self> {
        let prefix = normalize_prefix(prefix);
        let registry = Arc::new(Registry::new());

        let ring_remaining = IntGaugeVec::new(
            Opts::new(
                format!("{}_ring_remaining", prefix),
                "Ring queue remaining capacity",
            ),
            LABELS,
        )
        .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;
        registry
            .register(Box::new(ring_remaining.clone()))
            .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;

        let writer_queue_depth = IntGaugeVec::new(
            Opts::new(
                format!("{}_writer_queue_depth", prefix),
                "Async writer FIFO depth",
            ),
            LABELS,
        )
        .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;
        registry
            .register(Box::new(writer_queue_depth.clone()))
            .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;

        let persist_batch_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_persist_batch_seconds", prefix),
                "Persist batch latency",
            )
            .buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0,
            ]),
            LABELS,
        )
        .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;
        registry
            .register(Box::new(persist_batch_seconds.clone()))
            .map_err(|e| Error::Initialization(format!("metrics: {}", e)))?;

        Ok(Self {
            ring_remaining,
            writer_queue_depth,
            persist_batch_seconds,
            registry,
        })
    }

    /// Registry for scraping/exposition by the host.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches(['.', '_']);
    if trimmed.is_empty() {
        return "ledger".to_string();
    }
    trimmed.replace(['.', '-'], "_")
}
