//! Query planning: decide whether a tree can answer a query
//!
//! Planning binds a [`StarTreeQuery`] to one tree's metadata and the
//! segment's dictionaries. Every group-by and predicate column must be a
//! split dimension, every predicate must be an equality or IN list, and
//! every requested aggregation must be one of the tree's pre-aggregated
//! pairs. Anything else produces a [`FallbackReason`] and the caller scans
//! raw rows instead.
//!
//! Predicate values are translated to dictionary ids here. A value the
//! dictionary does not contain matches no row, so it resolves to an empty id
//! set and the query answers with zero rows.

use std::fmt;
use tracing::debug;

use super::request::{Predicate, QueryAggregation, StarTreeQuery};
use crate::aggregation::FunctionColumnPair;
use crate::dictionary::SegmentDictionaries;
use crate::error::{Error, Result};
use crate::startree::StarTreeMetadata;
use crate::types::DimensionId;

// ============================================================================
// Outcome
// ============================================================================

/// Why a query cannot be served from the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// A group-by or predicate column is not a split dimension
    UnknownDimension(String),
    /// A range predicate on the named column
    RangePredicate(String),
    /// The tree never pre-aggregated this aggregation
    UnsupportedAggregation(String),
    /// The query requests no aggregation
    NoAggregations,
}

impl FallbackReason {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            FallbackReason::UnknownDimension(_) => "fallback_unknown_dimension",
            FallbackReason::RangePredicate(_) => "fallback_range_predicate",
            FallbackReason::UnsupportedAggregation(_) => "fallback_unsupported_aggregation",
            FallbackReason::NoAggregations => "fallback_no_aggregations",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::UnknownDimension(column) => {
                write!(f, "'{}' is not a split dimension of the tree", column)
            }
            FallbackReason::RangePredicate(column) => {
                write!(f, "range predicate on '{}'", column)
            }
            FallbackReason::UnsupportedAggregation(label) => {
                write!(f, "{} is not pre-aggregated", label)
            }
            FallbackReason::NoAggregations => f.write_str("query requests no aggregation"),
        }
    }
}

/// Result of planning
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// The tree can answer the query
    Plan(QueryPlan),
    /// The caller must scan raw rows
    Fallback(FallbackReason),
}

// ============================================================================
// Plan
// ============================================================================

/// One output column of a plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAggregation {
    /// Result column label
    pub label: String,
    /// State index in the tree's records
    pub pair_index: usize,
    /// Slot in the evaluator's accumulated states
    pub slot: usize,
    /// Quantile for percentile kinds
    pub quantile: Option<f64>,
}

/// A query bound to one tree
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Group-by column names, in output order
    pub group_by: Vec<String>,
    /// Split level of each group-by column, in output order
    pub group_levels: Vec<usize>,
    /// Per split level: sorted ids a record must carry, `None` when unfiltered
    pub filters: Vec<Option<Vec<DimensionId>>>,
    /// Per split level: whether it is grouped on
    pub grouped: Vec<bool>,
    /// Output columns, in request order
    pub outputs: Vec<PlannedAggregation>,
    /// Distinct record state indexes the evaluator accumulates
    pub needed_pairs: Vec<usize>,
}

impl QueryPlan {
    /// Deepest split level that is filtered or grouped
    pub fn last_constrained(&self) -> Option<usize> {
        (0..self.filters.len())
            .rev()
            .find(|&level| self.filters[level].is_some() || self.grouped[level])
    }

    /// Whether some predicate can match no record at all
    pub fn matches_nothing(&self) -> bool {
        self.filters.iter().flatten().any(|ids| ids.is_empty())
    }

    /// Whether `key` passes every filter at `from_level` and below
    pub fn matches(&self, key: &[DimensionId], from_level: usize) -> bool {
        self.filters
            .iter()
            .enumerate()
            .skip(from_level)
            .all(|(level, filter)| match filter {
                Some(ids) => ids.binary_search(&key[level]).is_ok(),
                None => true,
            })
    }

    /// Group key of a record, in group-by order
    pub fn project(&self, key: &[DimensionId]) -> Vec<DimensionId> {
        self.group_levels.iter().map(|&level| key[level]).collect()
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Binds queries to one tree
#[derive(Debug, Clone, Copy)]
pub struct QueryPlanner<'a> {
    metadata: &'a StarTreeMetadata,
    dictionaries: &'a SegmentDictionaries,
}

impl<'a> QueryPlanner<'a> {
    /// Create a planner for a tree and its segment's dictionaries
    pub fn new(metadata: &'a StarTreeMetadata, dictionaries: &'a SegmentDictionaries) -> Self {
        Self {
            metadata,
            dictionaries,
        }
    }

    /// Plan a query
    ///
    /// Returns `Err` only for malformed requests (a quantile outside
    /// `[0, 1]`, a quantile on a non-percentile aggregation, a split
    /// dimension without a dictionary). Queries the tree cannot serve are
    /// reported as [`PlanOutcome::Fallback`].
    pub fn plan(&self, query: &StarTreeQuery) -> Result<PlanOutcome> {
        if query.aggregations.is_empty() {
            return Ok(self.fallback(FallbackReason::NoAggregations));
        }

        let dims = self.metadata.dimension_count();
        let mut grouped = vec![false; dims];
        let mut group_by = Vec::with_capacity(query.group_by.len());
        let mut group_levels = Vec::with_capacity(query.group_by.len());
        for column in &query.group_by {
            let Some(level) = self.metadata.level_of(column) else {
                return Ok(self.fallback(FallbackReason::UnknownDimension(column.clone())));
            };
            if !grouped[level] {
                grouped[level] = true;
                group_by.push(column.clone());
                group_levels.push(level);
            }
        }

        let mut filters: Vec<Option<Vec<DimensionId>>> = vec![None; dims];
        for predicate in &query.predicates {
            let column = predicate.column();
            let Some(level) = self.metadata.level_of(column) else {
                return Ok(self.fallback(FallbackReason::UnknownDimension(column.to_string())));
            };
            if predicate.is_range() {
                return Ok(self.fallback(FallbackReason::RangePredicate(column.to_string())));
            }
            let ids = self.resolve_ids(predicate)?;
            // Conjunctive predicates on one column intersect
            filters[level] = Some(match filters[level].take() {
                Some(existing) => existing
                    .into_iter()
                    .filter(|id| ids.binary_search(id).is_ok())
                    .collect(),
                None => ids,
            });
        }

        let mut outputs = Vec::with_capacity(query.aggregations.len());
        let mut needed_pairs: Vec<usize> = Vec::new();
        for aggregation in &query.aggregations {
            let Some(pair_index) = self.pair_index(aggregation)? else {
                return Ok(self.fallback(FallbackReason::UnsupportedAggregation(
                    aggregation.label(),
                )));
            };
            let slot = match needed_pairs.iter().position(|&p| p == pair_index) {
                Some(slot) => slot,
                None => {
                    needed_pairs.push(pair_index);
                    needed_pairs.len() - 1
                }
            };
            outputs.push(PlannedAggregation {
                label: aggregation.label(),
                pair_index,
                slot,
                quantile: aggregation.quantile,
            });
        }

        Ok(PlanOutcome::Plan(QueryPlan {
            group_by,
            group_levels,
            filters,
            grouped,
            outputs,
            needed_pairs,
        }))
    }

    fn fallback(&self, reason: FallbackReason) -> PlanOutcome {
        debug!(reason = %reason, "Query falls back to raw scan");
        PlanOutcome::Fallback(reason)
    }

    /// Sorted, deduplicated ids of the predicate's values present in the dictionary
    fn resolve_ids(&self, predicate: &Predicate) -> Result<Vec<DimensionId>> {
        let column = predicate.column();
        let dictionary = self.dictionaries.get(column).ok_or_else(|| {
            Error::InvalidInput(format!("no dictionary for split dimension '{}'", column))
        })?;
        let mut ids: Vec<DimensionId> = match predicate {
            Predicate::Eq { value, .. } => dictionary.id_of(value).into_iter().collect(),
            Predicate::In { values, .. } => {
                values.iter().filter_map(|v| dictionary.id_of(v)).collect()
            }
            Predicate::Range { .. } => Vec::new(),
        };
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// State index of the pair serving `aggregation`, `None` when not pre-aggregated
    fn pair_index(&self, aggregation: &QueryAggregation) -> Result<Option<usize>> {
        if let Some(q) = aggregation.quantile {
            if !aggregation.function.is_percentile() {
                return Err(Error::InvalidInput(format!(
                    "{} takes no quantile",
                    aggregation.function.name()
                )));
            }
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::InvalidInput(format!(
                    "quantile {} of {} is outside [0, 1]",
                    q,
                    aggregation.label()
                )));
            }
        }
        // A pair that cannot even be formed (e.g. SUM(*)) was never pre-aggregated
        Ok(
            FunctionColumnPair::new(aggregation.function, aggregation.column.as_str())
                .ok()
                .and_then(|pair| self.metadata.pair_index(&pair)),
        )
    }
}
