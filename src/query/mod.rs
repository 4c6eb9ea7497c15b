//! Star-tree query engine
//!
//! Answers group-by / aggregate requests from a tree's pre-aggregated
//! records, or reports that the caller must scan raw rows.
//!
//! # Architecture
//!
//! ```text
//! StarTreeQuery
//!      │
//!      ▼
//! ┌─────────────┐
//! │    Plan     │  columns → split levels, values → dictionary ids,
//! └─────────────┘  aggregations → pre-aggregated pairs
//!      │
//!      ├──────────────▶ FallbackRequired(reason)
//!      ▼
//! ┌─────────────┐
//! │  Traverse   │  filtered / grouped / star levels, leaf record scans
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Merge     │  transient per-group states, id order
//! └─────────────┘
//!      │
//!      ▼
//! QueryResult (decoded group values, final values, merged states)
//! ```
//!
//! The evaluator is generic over [`StarTreeSource`](crate::startree::StarTreeSource),
//! so the same query runs over an in-memory tree or a mapped file.

pub mod evaluator;
pub mod planner;
pub mod request;
pub mod result;

pub use evaluator::{Evaluation, QueryEvaluator};
pub use planner::{FallbackReason, PlanOutcome, PlannedAggregation, QueryPlan, QueryPlanner};
pub use request::{Predicate, QueryAggregation, StarTreeQuery};
pub use result::{QueryResult, ResultRow};
