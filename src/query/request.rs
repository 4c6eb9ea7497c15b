//! Star-tree query requests
//!
//! A [`StarTreeQuery`] names the group-by dimensions, dimension predicates
//! and requested aggregations, all by column name. It is independent of any
//! particular tree; [`QueryPlanner`](super::QueryPlanner) binds it to one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregation::{AggregationType, STAR_COLUMN};
use crate::types::DimensionValue;

// ============================================================================
// Predicates
// ============================================================================

/// Predicate on one dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// `column = value`
    Eq {
        /// Dimension column
        column: String,
        /// Required value
        value: DimensionValue,
    },
    /// `column IN (values)`
    In {
        /// Dimension column
        column: String,
        /// Accepted values
        values: Vec<DimensionValue>,
    },
    /// `lower <= column <= upper`, either bound optional
    Range {
        /// Dimension column
        column: String,
        /// Inclusive lower bound
        lower: Option<DimensionValue>,
        /// Inclusive upper bound
        upper: Option<DimensionValue>,
    },
}

impl Predicate {
    /// Create an equality predicate
    pub fn equals(column: impl Into<String>, value: impl Into<DimensionValue>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Create a set-membership predicate
    pub fn in_set<V: Into<DimensionValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a range predicate
    pub fn range(
        column: impl Into<String>,
        lower: Option<DimensionValue>,
        upper: Option<DimensionValue>,
    ) -> Self {
        Predicate::Range {
            column: column.into(),
            lower,
            upper,
        }
    }

    /// Column the predicate applies to
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Range { column, .. } => column,
        }
    }

    /// Whether this is a range predicate
    pub fn is_range(&self) -> bool {
        matches!(self, Predicate::Range { .. })
    }
}

// ============================================================================
// Aggregations
// ============================================================================

/// One requested aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAggregation {
    /// Aggregation kind
    pub function: AggregationType,
    /// Metric column, `*` for `COUNT(*)`
    pub column: String,
    /// Quantile in `[0, 1]` for percentile kinds
    pub quantile: Option<f64>,
}

impl QueryAggregation {
    /// Create an aggregation without a quantile
    pub fn new(function: AggregationType, column: impl Into<String>) -> Self {
        Self {
            function,
            column: column.into(),
            quantile: None,
        }
    }

    /// Result column label, e.g. `SUM(salary)` or `PERCENTILEEST(latency, 0.9)`
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QueryAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quantile {
            Some(q) => write!(f, "{}({}, {})", self.function.name(), self.column, q),
            None => write!(f, "{}({})", self.function.name(), self.column),
        }
    }
}

// ============================================================================
// Query
// ============================================================================

/// A group-by / aggregate request
///
/// # Example
///
/// ```rust
/// use kuba_startree::aggregation::AggregationType;
/// use kuba_startree::query::StarTreeQuery;
///
/// let query = StarTreeQuery::new()
///     .group_by(["country"])
///     .filter_eq("browser", "firefox")
///     .aggregate(AggregationType::Sum, "clicks")
///     .percentile(AggregationType::PercentileEst, "latency", 0.99);
/// assert_eq!(query.aggregations.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StarTreeQuery {
    /// Group-by dimensions, in output order
    pub group_by: Vec<String>,
    /// Conjunctive predicates
    pub predicates: Vec<Predicate>,
    /// Requested aggregations, in output order
    pub aggregations: Vec<QueryAggregation>,
}

impl StarTreeQuery {
    /// Create an empty query
    pub fn new() -> Self {
        Self::default()
    }

    /// Add group-by dimensions
    pub fn group_by<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Add a predicate
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Add `column = value`
    pub fn filter_eq(self, column: impl Into<String>, value: impl Into<DimensionValue>) -> Self {
        self.filter(Predicate::equals(column, value))
    }

    /// Add `column IN (values)`
    pub fn filter_in<V: Into<DimensionValue>>(
        self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(Predicate::in_set(column, values))
    }

    /// Add `lower <= column <= upper`
    pub fn filter_range(
        self,
        column: impl Into<String>,
        lower: Option<DimensionValue>,
        upper: Option<DimensionValue>,
    ) -> Self {
        self.filter(Predicate::range(column, lower, upper))
    }

    /// Request an aggregation
    pub fn aggregate(mut self, function: AggregationType, column: impl Into<String>) -> Self {
        self.aggregations.push(QueryAggregation::new(function, column));
        self
    }

    /// Request `COUNT(*)`
    pub fn count_star(self) -> Self {
        self.aggregate(AggregationType::Count, STAR_COLUMN)
    }

    /// Request a percentile at quantile `q`
    pub fn percentile(
        mut self,
        function: AggregationType,
        column: impl Into<String>,
        q: f64,
    ) -> Self {
        self.aggregations.push(QueryAggregation {
            function,
            column: column.into(),
            quantile: Some(q),
        });
        self
    }
}
