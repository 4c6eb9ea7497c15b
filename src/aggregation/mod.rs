//! Pluggable numeric aggregation framework
//!
//! Every pre-aggregated `(function, column)` pair is served by one
//! [`ValueAggregator`], which dispatches over a closed set of kinds:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        FunctionColumnPair           │
//! │   "SUM__salary", "COUNT__*", ...    │
//! └─────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────┐
//! │          ValueAggregator            │
//! │  init / merge / serialize / extract │
//! └─────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────┐
//! │          AggregatorState            │
//! │ exact values │ KMV │ q-digest │ t-d │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - **Exact kinds**: SUM (checked i64 or compensated f64), MIN/MAX in the
//!   column's native type, COUNT (checked u64), AVG, DISTINCTCOUNT
//! - **Approximate kinds**: DISTINCTCOUNTKMV ([`KmvSketch`]), PERCENTILEEST
//!   ([`QuantileDigest`], rank error ≤ ε·n), PERCENTILETDIGEST (t-digest)
//!
//! # Example
//!
//! ```rust
//! use kuba_startree::aggregation::{AggregateValue, AggregatorParams, ValueAggregator};
//! use kuba_startree::types::{DataType, MetricValue};
//!
//! let sum = ValueAggregator::new(
//!     "SUM__clicks".parse().unwrap(),
//!     Some(DataType::Int64),
//!     AggregatorParams::default(),
//! )
//! .unwrap();
//!
//! let a = sum.init(Some(&MetricValue::Int64(10))).unwrap();
//! let b = sum.init(Some(&MetricValue::Int64(5))).unwrap();
//! let total = sum.merge(&a, &b).unwrap();
//! assert_eq!(sum.extract(&total, None), AggregateValue::Long(15));
//! ```

pub mod distinct;
pub mod function;
pub mod numeric;
pub mod quantile_digest;
pub mod state;
pub mod value_aggregator;

pub use distinct::KmvSketch;
pub use function::{AggregationType, FunctionColumnPair, STAR_COLUMN};
pub use quantile_digest::QuantileDigest;
pub use state::AggregatorState;
pub use value_aggregator::{
    AggregateValue, AggregatorParams, ValueAggregator, DEFAULT_QUANTILE, TDIGEST_MAX_MAGNITUDE,
};
