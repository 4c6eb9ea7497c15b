//! Metrics for star-tree builds and queries
//!
//! Prometheus counters and histograms registered in the default registry.
//! The library only records; exporting is left to the embedding process
//! (see [`gather_metrics`]).

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

use crate::error::{Error, Result};

lazy_static! {
    // === Build ===

    /// Total tree builds by outcome
    pub static ref BUILDS_TOTAL: CounterVec = register_counter_vec!(
        "startree_builds_total",
        "Total star-tree builds",
        &["status"]
    ).unwrap();

    /// Build duration
    pub static ref BUILD_DURATION: HistogramVec = register_histogram_vec!(
        "startree_build_duration_seconds",
        "Star-tree build latency in seconds",
        &["status"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    /// Nodes produced by builds, by kind
    pub static ref NODES_TOTAL: CounterVec = register_counter_vec!(
        "startree_nodes_total",
        "Total star-tree nodes built by kind",
        &["kind"]
    ).unwrap();

    // === Query ===

    /// Queries by outcome (answered, fallback reason, error)
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "startree_queries_total",
        "Total star-tree query evaluations by outcome",
        &["outcome"]
    ).unwrap();

    /// Nodes visited per answered query
    pub static ref QUERY_NODES_VISITED: Histogram = register_histogram!(
        "startree_query_nodes_visited",
        "Tree nodes visited per answered query",
        vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::InvalidInput(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| Error::InvalidInput(format!("Metrics contain invalid UTF-8: {}", e)))
}

/// Record a finished build
#[inline]
pub fn record_build(duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    BUILDS_TOTAL.with_label_values(&[status]).inc();
    BUILD_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record the node counts of a build
#[inline]
pub fn record_nodes(internal: usize, leaves: usize, stars: usize) {
    NODES_TOTAL
        .with_label_values(&["internal"])
        .inc_by(internal as f64);
    NODES_TOTAL
        .with_label_values(&["leaf"])
        .inc_by(leaves as f64);
    NODES_TOTAL
        .with_label_values(&["star"])
        .inc_by(stars as f64);
}

/// Record a query outcome
#[inline]
pub fn record_query(outcome: &str) {
    QUERIES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record how many nodes an answered query touched
#[inline]
pub fn record_nodes_visited(count: usize) {
    QUERY_NODES_VISITED.observe(count as f64);
}
