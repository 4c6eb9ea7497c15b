//! Kuba Star-Tree - segment-local OLAP pre-aggregation index
//!
//! This library builds and queries star-trees over immutable segments:
//! - Dictionary encoding of dimension values to dense ids
//! - Exact and approximate aggregators (SUM, MIN/MAX, COUNT, AVG, distinct
//!   counts, q-digest and t-digest percentiles) with mergeable states
//! - Single-shot tree construction with star (wildcard) nodes
//! - A memory-mappable, checksummed persisted format
//! - Query evaluation that answers from pre-aggregated nodes or signals
//!   that a raw scan is required

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dictionary;
pub mod error;
pub mod types;

mod codec;

/// Prometheus metrics for builds and queries
pub mod metrics;

/// Index configuration with TOML support
pub mod config;

/// Aggregation functions, mergeable states and sketches
pub mod aggregation;

/// Tree arena, builder and persisted format
pub mod startree;

/// Query planning and evaluation over a star-tree
pub mod query;

// Re-export main types
pub use config::StarTreeIndexConfig;
pub use dictionary::SegmentDictionaries;
pub use error::{Error, Result};
pub use query::{Evaluation, QueryEvaluator, StarTreeQuery};
pub use startree::{StarTree, StarTreeBuilder, StarTreeReader, StarTreeSource};
pub use types::{DimensionId, DimensionValue, MetricValue};
