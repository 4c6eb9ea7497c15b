//! Configuration management for the star-tree index
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.
//!
//! ```toml
//! [star_tree]
//! dimensions_split_order = ["country", "browser", "os"]
//! skip_star_node_creation = ["os"]
//! function_column_pairs = ["COUNT__*", "SUM__clicks", "PERCENTILEEST__latency"]
//! star_threshold = 1
//! max_leaf_records = 10000
//!
//! [aggregation]
//! percentile_max_error = 0.05
//!
//! [build]
//! parallel = true
//! ```
//!
//! A config is turned into a [`ResolvedConfig`] against one segment schema.
//! That is the only place names are mapped to column positions and
//! aggregators are constructed; the resolved value is then handed by reference
//! to the builder.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::aggregation::{AggregatorParams, FunctionColumnPair, ValueAggregator};
use crate::error::{Error, Result};
use crate::types::SegmentSchema;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StarTreeIndexConfig {
    /// Tree shape and pre-aggregated pairs
    pub star_tree: StarTreeSection,

    /// Sketch parameters
    #[serde(default)]
    pub aggregation: AggregationSection,

    /// Builder tuning
    #[serde(default)]
    pub build: BuildSection,

    /// Logging
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Tree shape configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StarTreeSection {
    /// Dimensions to split on, root first
    pub dimensions_split_order: Vec<String>,

    /// Split dimensions that never get a star child
    #[serde(default)]
    pub skip_star_node_creation: Vec<String>,

    /// Pre-aggregated pairs, `FUNCTION__column`
    #[serde(default)]
    pub function_column_pairs: Vec<String>,

    /// A node gets a star child once it has more than this many distinct values
    #[serde(default = "default_star_threshold")]
    pub star_threshold: usize,

    /// Nodes with at most this many records stop splitting
    #[serde(default = "default_max_leaf_records")]
    pub max_leaf_records: usize,
}

/// Sketch parameters
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AggregationSection {
    /// Rank error bound of PERCENTILEEST
    #[serde(default = "default_percentile_max_error")]
    pub percentile_max_error: f64,

    /// Max centroids of PERCENTILETDIGEST
    #[serde(default = "default_tdigest_compression")]
    pub tdigest_compression: usize,

    /// Hashes kept by DISTINCTCOUNTKMV
    #[serde(default = "default_kmv_sketch_size")]
    pub kmv_sketch_size: usize,
}

/// Builder tuning
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuildSection {
    /// Build sibling subtrees on the rayon pool
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Smallest record range worth splitting across threads
    #[serde(default = "default_parallel_min_records")]
    pub parallel_min_records: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or an env-filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_star_threshold() -> usize { 1 }
fn default_max_leaf_records() -> usize { 10_000 }
fn default_percentile_max_error() -> f64 { 0.05 }
fn default_tdigest_compression() -> usize { 100 }
fn default_kmv_sketch_size() -> usize { 1024 }
fn default_parallel_min_records() -> usize { 50_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for StarTreeSection {
    fn default() -> Self {
        Self {
            dimensions_split_order: Vec::new(),
            skip_star_node_creation: Vec::new(),
            function_column_pairs: Vec::new(),
            star_threshold: default_star_threshold(),
            max_leaf_records: default_max_leaf_records(),
        }
    }
}

impl Default for AggregationSection {
    fn default() -> Self {
        Self {
            percentile_max_error: default_percentile_max_error(),
            tdigest_compression: default_tdigest_compression(),
            kmv_sketch_size: default_kmv_sketch_size(),
        }
    }
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            parallel: true,
            parallel_min_records: default_parallel_min_records(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

impl LoggingSection {
    /// Env-filter directives for the crate and its tools
    ///
    /// A bare level applies to `kuba_startree` and `startree_tool`; anything
    /// else is passed through as a full directive string.
    pub fn filter_directives(&self) -> String {
        let level = self.level.trim();
        if LOG_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level)) {
            let level = level.to_ascii_lowercase();
            format!("kuba_startree={level},startree_tool={level}")
        } else {
            level.to_string()
        }
    }
}

impl StarTreeIndexConfig {
    /// Config splitting on `split_order` and pre-aggregating `pairs`
    pub fn new<S: AsRef<str>>(split_order: &[S], pairs: &[S]) -> Self {
        let mut config = Self::default();
        config.star_tree.dimensions_split_order =
            split_order.iter().map(|s| s.as_ref().to_string()).collect();
        config.star_tree.function_column_pairs =
            pairs.iter().map(|s| s.as_ref().to_string()).collect();
        config
    }

    /// Set the star threshold
    pub fn with_star_threshold(mut self, threshold: usize) -> Self {
        self.star_tree.star_threshold = threshold;
        self
    }

    /// Set the max leaf records
    pub fn with_max_leaf_records(mut self, max: usize) -> Self {
        self.star_tree.max_leaf_records = max;
        self
    }

    /// Never create a star child for `dimension`
    pub fn with_skip_star(mut self, dimension: &str) -> Self {
        self.star_tree
            .skip_star_node_creation
            .push(dimension.to_string());
        self
    }

    /// Enable or disable parallel building
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.build.parallel = parallel;
        self
    }

    /// Set the smallest record range split across threads
    pub fn with_parallel_min_records(mut self, min: usize) -> Self {
        self.build.parallel_min_records = min;
        self
    }

    /// Set the sketch parameters
    pub fn with_aggregator_params(mut self, params: AggregatorParams) -> Self {
        self.aggregation.percentile_max_error = params.percentile_max_error;
        self.aggregation.tdigest_compression = params.tdigest_compression;
        self.aggregation.kmv_sketch_size = params.kmv_sketch_size;
        self
    }

    /// Sketch parameters as used by aggregators
    pub fn aggregator_params(&self) -> AggregatorParams {
        AggregatorParams {
            percentile_max_error: self.aggregation.percentile_max_error,
            tdigest_compression: self.aggregation.tdigest_compression,
            kmv_sketch_size: self.aggregation.kmv_sketch_size,
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(threshold) = std::env::var("STARTREE_STAR_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.star_tree.star_threshold = t;
            }
        }
        if let Ok(max_leaf) = std::env::var("STARTREE_MAX_LEAF_RECORDS") {
            if let Ok(m) = max_leaf.parse() {
                self.star_tree.max_leaf_records = m;
            }
        }
        if let Ok(parallel) = std::env::var("STARTREE_PARALLEL_BUILD") {
            if let Ok(p) = parallel.parse() {
                self.build.parallel = p;
            }
        }

        // Logging
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Validate configuration (schema independent checks)
    pub fn validate(&self) -> Result<()> {
        let tree = &self.star_tree;
        if tree.dimensions_split_order.is_empty() {
            return Err(Error::config("dimensions_split_order cannot be empty"));
        }

        let mut seen = HashSet::new();
        for dim in &tree.dimensions_split_order {
            if !seen.insert(dim.as_str()) {
                return Err(Error::config(format!(
                    "dimension '{}' appears twice in dimensions_split_order",
                    dim
                )));
            }
        }
        for dim in &tree.skip_star_node_creation {
            if !seen.contains(dim.as_str()) {
                return Err(Error::config(format!(
                    "skip_star_node_creation names '{}', which is not in dimensions_split_order",
                    dim
                )));
            }
        }

        if tree.function_column_pairs.is_empty() {
            return Err(Error::config("function_column_pairs cannot be empty"));
        }
        let mut pairs = HashSet::new();
        for raw in &tree.function_column_pairs {
            let pair: FunctionColumnPair = raw.parse()?;
            if !pairs.insert(pair.clone()) {
                return Err(Error::config(format!("duplicate function-column pair '{}'", pair)));
            }
        }

        self.aggregator_params().validate()?;

        if self.build.parallel_min_records == 0 {
            return Err(Error::config("parallel_min_records must be > 0"));
        }

        if self.logging.level.trim().is_empty() {
            return Err(Error::config("logging.level cannot be empty"));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            Error::config(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }

    /// Bind the config to a segment schema
    pub fn resolve(&self, schema: &SegmentSchema) -> Result<ResolvedConfig> {
        self.validate()?;
        let tree = &self.star_tree;

        let split_dimensions = tree
            .dimensions_split_order
            .iter()
            .map(|name| {
                schema.dimension_index(name).ok_or_else(|| {
                    Error::config(format!(
                        "split order references unknown dimension '{}'",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let skip_star = tree
            .dimensions_split_order
            .iter()
            .map(|name| tree.skip_star_node_creation.contains(name))
            .collect();

        let params = self.aggregator_params();
        let mut metric_columns = Vec::with_capacity(tree.function_column_pairs.len());
        let mut aggregators = Vec::with_capacity(tree.function_column_pairs.len());
        for raw in &tree.function_column_pairs {
            let pair: FunctionColumnPair = raw.parse()?;
            let (column, input_type) = if pair.is_star_column() {
                (None, None)
            } else {
                let idx = schema.metric_index(pair.column()).ok_or_else(|| {
                    Error::config(format!(
                        "pair '{}' references unknown metric '{}'",
                        pair,
                        pair.column()
                    ))
                })?;
                (Some(idx), Some(schema.metrics[idx].data_type))
            };
            metric_columns.push(column);
            aggregators.push(ValueAggregator::new(pair, input_type, params)?);
        }

        Ok(ResolvedConfig {
            schema: schema.clone(),
            split_order: tree.dimensions_split_order.clone(),
            split_dimensions,
            skip_star,
            metric_columns,
            aggregators,
            star_threshold: tree.star_threshold,
            max_leaf_records: tree.max_leaf_records,
            parallel: self.build.parallel,
            parallel_min_records: self.build.parallel_min_records,
        })
    }
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// A configuration bound to one segment schema
///
/// Column names are resolved to positions and one [`ValueAggregator`] exists
/// per pre-aggregated pair, in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    schema: SegmentSchema,
    split_order: Vec<String>,
    split_dimensions: Vec<usize>,
    skip_star: Vec<bool>,
    metric_columns: Vec<Option<usize>>,
    aggregators: Vec<ValueAggregator>,
    star_threshold: usize,
    max_leaf_records: usize,
    parallel: bool,
    parallel_min_records: usize,
}

impl ResolvedConfig {
    /// Segment schema the config was resolved against
    pub fn schema(&self) -> &SegmentSchema {
        &self.schema
    }

    /// Split dimension names, root first
    pub fn split_order(&self) -> &[String] {
        &self.split_order
    }

    /// Schema positions of the split dimensions
    pub fn split_dimensions(&self) -> &[usize] {
        &self.split_dimensions
    }

    /// Per split level: whether star creation is disabled
    pub fn skip_star(&self) -> &[bool] {
        &self.skip_star
    }

    /// Per pair: schema position of its metric (`None` for `COUNT__*`)
    pub fn metric_columns(&self) -> &[Option<usize>] {
        &self.metric_columns
    }

    /// One aggregator per pair
    pub fn aggregators(&self) -> &[ValueAggregator] {
        &self.aggregators
    }

    /// Star threshold
    pub fn star_threshold(&self) -> usize {
        self.star_threshold
    }

    /// Max leaf records
    pub fn max_leaf_records(&self) -> usize {
        self.max_leaf_records
    }

    /// Whether sibling subtrees may be built in parallel
    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// Smallest record range split across threads
    pub fn parallel_min_records(&self) -> usize {
        self.parallel_min_records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, DimensionType};

    fn schema() -> SegmentSchema {
        SegmentSchema::new()
            .with_dimension("d1", DimensionType::String)
            .with_dimension("d2", DimensionType::String)
            .with_metric("m", DataType::Int64)
    }

    fn config() -> StarTreeIndexConfig {
        StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m", "COUNT__*"])
    }

    #[test]
    fn test_default_config() {
        let config = StarTreeIndexConfig::default();
        assert_eq!(config.star_tree.star_threshold, 1);
        assert_eq!(config.star_tree.max_leaf_records, 10_000);
        assert!(config.build.parallel);
        // no split order yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let dup = StarTreeIndexConfig::new(&["d1", "d1"], &["SUM__m"]);
        assert!(dup.validate().is_err());

        let bad_skip = config().with_skip_star("d3");
        assert!(bad_skip.validate().is_err());

        let dup_pair = StarTreeIndexConfig::new(&["d1"], &["SUM__m", "sum__m"]);
        assert!(dup_pair.validate().is_err());

        let star_sum = StarTreeIndexConfig::new(&["d1"], &["SUM__*"]);
        assert!(star_sum.validate().is_err());
    }

    #[test]
    fn test_toml_parse() {
        let config = StarTreeIndexConfig::from_toml_str(
            r#"
            [star_tree]
            dimensions_split_order = ["d1", "d2"]
            skip_star_node_creation = ["d2"]
            function_column_pairs = ["MAX__m"]
            star_threshold = 3

            [aggregation]
            percentile_max_error = 0.01
            "#,
        )
        .unwrap();
        assert_eq!(config.star_tree.star_threshold, 3);
        assert_eq!(config.star_tree.max_leaf_records, 10_000);
        assert_eq!(config.aggregation.percentile_max_error, 0.01);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve() {
        let resolved = config().with_skip_star("d2").resolve(&schema()).unwrap();
        assert_eq!(resolved.split_dimensions(), &[0, 1]);
        assert_eq!(resolved.skip_star(), &[false, true]);
        assert_eq!(resolved.metric_columns(), &[Some(0), None]);
        assert_eq!(resolved.aggregators().len(), 2);
        assert_eq!(resolved.aggregators()[0].input_type(), Some(DataType::Int64));
    }

    #[test]
    fn test_resolve_unknown_columns() {
        let unknown_dim = StarTreeIndexConfig::new(&["d9"], &["SUM__m"]);
        assert!(matches!(unknown_dim.resolve(&schema()), Err(Error::Config(_))));

        let unknown_metric = StarTreeIndexConfig::new(&["d1"], &["SUM__x"]);
        assert!(matches!(unknown_metric.resolve(&schema()), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("startree.toml");
        let config = config().with_star_threshold(4);
        config.save_to_file(&path).unwrap();
        let loaded = StarTreeIndexConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("STARTREE_MAX_LEAF_RECORDS", "77");
        let config = StarTreeIndexConfig::from_env();
        assert_eq!(config.star_tree.max_leaf_records, 77);
        std::env::remove_var("STARTREE_MAX_LEAF_RECORDS");
    }

    #[test]
    fn test_logging_directives() {
        let mut logging = LoggingSection::default();
        assert_eq!(
            logging.filter_directives(),
            "kuba_startree=info,startree_tool=info"
        );

        logging.level = "DEBUG".to_string();
        assert_eq!(
            logging.filter_directives(),
            "kuba_startree=debug,startree_tool=debug"
        );

        logging.level = "kuba_startree::query=trace,warn".to_string();
        assert_eq!(logging.filter_directives(), "kuba_startree::query=trace,warn");

        let mut config = config();
        config.logging.level = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
