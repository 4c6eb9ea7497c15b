//! Query evaluation over a star-tree
//!
//! # Traversal
//!
//! Starting at the root, each split level is handled by what the query asks
//! of it:
//!
//! ```text
//! level kind      children visited
//! ─────────────   ─────────────────────────────────────────────
//! filtered        the explicit child of each accepted id
//! grouped         every explicit child
//! don't care      the star child, or every explicit child when the
//!                 level kept no star (nothing was collapsed)
//! ```
//!
//! Once no level at or below the current depth is filtered or grouped, the
//! node's stored record already holds the answer for its partition and is
//! used as is. A leaf reached above that point scans its leaf record buffer,
//! applying the remaining filters record by record.
//!
//! Matching records are merged into transient per-group states keyed by the
//! projected group key. A `BTreeMap` keeps groups in dictionary id order, so
//! repeated evaluations of a query over the same tree are identical.

use std::collections::BTreeMap;
use tracing::debug;

use super::planner::{FallbackReason, PlanOutcome, QueryPlan, QueryPlanner};
use super::request::StarTreeQuery;
use super::result::{QueryResult, ResultRow};
use crate::aggregation::{AggregatorState, ValueAggregator};
use crate::dictionary::SegmentDictionaries;
use crate::error::{Error, Result};
use crate::metrics;
use crate::startree::{AggregationRecord, NodeId, StarTreeSource};
use crate::types::DimensionId;

/// Outcome of evaluating a query
#[derive(Debug)]
pub enum Evaluation {
    /// The tree answered the query
    Answered(QueryResult),
    /// The caller must scan raw rows
    FallbackRequired(FallbackReason),
}

impl Evaluation {
    /// Whether the caller must fall back to a raw scan
    pub fn is_fallback(&self) -> bool {
        matches!(self, Evaluation::FallbackRequired(_))
    }

    /// The result, if answered
    pub fn into_result(self) -> Option<QueryResult> {
        match self {
            Evaluation::Answered(result) => Some(result),
            Evaluation::FallbackRequired(_) => None,
        }
    }
}

/// Evaluates queries against one tree
///
/// The evaluator only reads the tree; any number of evaluators may share
/// one source across threads.
///
/// # Example
///
/// ```rust
/// use kuba_startree::aggregation::AggregationType;
/// use kuba_startree::config::StarTreeIndexConfig;
/// use kuba_startree::dictionary::SegmentDictionaries;
/// use kuba_startree::query::{Evaluation, QueryEvaluator, StarTreeQuery};
/// use kuba_startree::startree::StarTreeBuilder;
/// use kuba_startree::types::*;
///
/// let schema = SegmentSchema::new()
///     .with_dimension("country", DimensionType::String)
///     .with_metric("clicks", DataType::Int64);
/// let rows = vec![
///     RawRow::new(vec!["us".into()], vec![MetricValue::Int64(3)]),
///     RawRow::new(vec!["fr".into()], vec![MetricValue::Int64(4)]),
/// ];
/// let dictionaries = SegmentDictionaries::build(&schema, &rows).unwrap();
/// let config = StarTreeIndexConfig::new(&["country"], &["SUM__clicks"])
///     .resolve(&schema)
///     .unwrap();
/// let tree = StarTreeBuilder::new(&config)
///     .build(&dictionaries.encode_rows(&rows).unwrap())
///     .unwrap();
///
/// let query = StarTreeQuery::new().aggregate(AggregationType::Sum, "clicks");
/// let evaluator = QueryEvaluator::new(&tree, &dictionaries);
/// match evaluator.evaluate(&query).unwrap() {
///     Evaluation::Answered(mut result) => {
///         assert_eq!(result.next().unwrap().values[0].as_f64(), Some(7.0));
///     }
///     Evaluation::FallbackRequired(reason) => panic!("{}", reason),
/// }
/// ```
#[derive(Debug)]
pub struct QueryEvaluator<'a, S: StarTreeSource> {
    source: &'a S,
    dictionaries: &'a SegmentDictionaries,
}

impl<'a, S: StarTreeSource> QueryEvaluator<'a, S> {
    /// Create an evaluator over a tree and its segment's dictionaries
    pub fn new(source: &'a S, dictionaries: &'a SegmentDictionaries) -> Self {
        Self {
            source,
            dictionaries,
        }
    }

    /// Plan a query without evaluating it
    pub fn plan(&self, query: &StarTreeQuery) -> Result<PlanOutcome> {
        QueryPlanner::new(self.source.metadata(), self.dictionaries).plan(query)
    }

    /// Whether the tree can answer `query`
    pub fn can_answer(&self, query: &StarTreeQuery) -> bool {
        matches!(self.plan(query), Ok(PlanOutcome::Plan(_)))
    }

    /// Evaluate a query
    pub fn evaluate(&self, query: &StarTreeQuery) -> Result<Evaluation> {
        let result = self
            .plan(query)
            .and_then(|outcome| match outcome {
                PlanOutcome::Plan(plan) => self.execute(&plan).map(Evaluation::Answered),
                PlanOutcome::Fallback(reason) => Ok(Evaluation::FallbackRequired(reason)),
            });

        match &result {
            Ok(Evaluation::Answered(_)) => metrics::record_query("answered"),
            Ok(Evaluation::FallbackRequired(reason)) => metrics::record_query(reason.label()),
            Err(_) => metrics::record_query("error"),
        }
        result
    }

    fn execute(&self, plan: &QueryPlan) -> Result<QueryResult> {
        let aggregators = &self.source.metadata().aggregators;
        let mut traversal = Traversal {
            source: self.source,
            plan,
            aggregators,
            last_constrained: plan.last_constrained(),
            groups: BTreeMap::new(),
            visited: 0,
        };
        if !plan.matches_nothing() {
            traversal.visit(NodeId::ROOT)?;
        }
        metrics::record_nodes_visited(traversal.visited);
        debug!(
            nodes_visited = traversal.visited,
            groups = traversal.groups.len(),
            "Evaluated star-tree query"
        );

        let rows = traversal
            .groups
            .into_iter()
            .map(|(group_ids, states)| self.materialize(plan, aggregators, group_ids, &states))
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryResult::new(
            plan.group_by.clone(),
            plan.outputs.iter().map(|o| o.label.clone()).collect(),
            rows,
        ))
    }

    fn materialize(
        &self,
        plan: &QueryPlan,
        aggregators: &[ValueAggregator],
        group_ids: Vec<DimensionId>,
        states: &[AggregatorState],
    ) -> Result<ResultRow> {
        let group_values = plan
            .group_by
            .iter()
            .zip(&group_ids)
            .map(|(column, id)| {
                self.dictionaries.decode(column, *id).cloned().ok_or_else(|| {
                    Error::corrupted(format!(
                        "id {} of '{}' is not in the segment dictionary",
                        id, column
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut values = Vec::with_capacity(plan.outputs.len());
        let mut serialized = Vec::with_capacity(plan.outputs.len());
        for output in &plan.outputs {
            let aggregator = &aggregators[output.pair_index];
            let state = &states[output.slot];
            values.push(aggregator.extract(state, output.quantile));
            serialized.push(aggregator.serialize(state)?);
        }

        Ok(ResultRow {
            group_ids,
            group_values,
            values,
            states: serialized,
        })
    }
}

// ============================================================================
// Traversal
// ============================================================================

struct Traversal<'t, S: StarTreeSource> {
    source: &'t S,
    plan: &'t QueryPlan,
    aggregators: &'t [ValueAggregator],
    last_constrained: Option<usize>,
    groups: BTreeMap<Vec<DimensionId>, Vec<AggregatorState>>,
    visited: usize,
}

impl<S: StarTreeSource> Traversal<'_, S> {
    fn visit(&mut self, id: NodeId) -> Result<()> {
        self.visited += 1;
        let (source, plan) = (self.source, self.plan);
        let node = source.node(id)?;
        let depth = node.depth as usize;

        if self.last_constrained.map_or(true, |last| depth > last) {
            let record = source.node_record(id)?;
            return self.accumulate(&record);
        }

        if node.is_leaf() {
            for index in node.leaf_records.clone() {
                let record = source.leaf_record(index)?;
                if plan.matches(record.key(), depth) {
                    self.accumulate(&record)?;
                }
            }
            return Ok(());
        }

        let level = depth;
        if let Some(ids) = &plan.filters[level] {
            for &dimension_id in ids {
                if let Some(child) = source.find_child(&node, dimension_id)? {
                    self.visit(child)?;
                }
            }
            return Ok(());
        }

        let star = source.star_child(&node)?;
        match star {
            Some(star) if !plan.grouped[level] => self.visit(star),
            _ => {
                let explicit_end = if star.is_some() {
                    node.children.end - 1
                } else {
                    node.children.end
                };
                for child in node.children.start..explicit_end {
                    self.visit(NodeId(child))?;
                }
                Ok(())
            }
        }
    }

    fn accumulate(&mut self, record: &AggregationRecord) -> Result<()> {
        let key = self.plan.project(record.key());
        if key.iter().any(|id| id.is_star()) {
            return Err(Error::corrupted(format!(
                "record {:?} reached a grouped level through a star node",
                record.key()
            )));
        }

        let states = record.states();
        match self.groups.get_mut(&key) {
            Some(accumulated) => {
                for (slot, &pair) in self.plan.needed_pairs.iter().enumerate() {
                    self.aggregators[pair].merge_into(&mut accumulated[slot], &states[pair])?;
                }
            }
            None => {
                let initial = self
                    .plan
                    .needed_pairs
                    .iter()
                    .map(|&pair| states[pair].clone())
                    .collect();
                self.groups.insert(key, initial);
            }
        }
        Ok(())
    }
}
