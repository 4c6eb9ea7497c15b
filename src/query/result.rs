//! Query result types

use serde::Serialize;
use std::fmt;
use std::vec;

use crate::aggregation::AggregateValue;
use crate::types::{DimensionId, DimensionValue};

/// One output row: a group and its aggregate values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// Group key as dictionary ids, in group-by order
    pub group_ids: Vec<DimensionId>,
    /// Group key decoded through the dictionaries
    pub group_values: Vec<DimensionValue>,
    /// Final values, one per requested aggregation
    pub values: Vec<AggregateValue>,
    /// Serialized merged state behind each value
    pub states: Vec<Vec<u8>>,
}

impl fmt::Display for ResultRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.group_values.iter().map(|v| v.to_string()).collect();
        let values: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}] {}", groups.join(", "), values.join(", "))
    }
}

/// Rows of an answered query, in ascending group-id order
///
/// The result is consumed by iteration; evaluate again for a fresh one.
#[derive(Debug)]
pub struct QueryResult {
    group_by: Vec<String>,
    labels: Vec<String>,
    rows: vec::IntoIter<ResultRow>,
}

impl QueryResult {
    pub(crate) fn new(group_by: Vec<String>, labels: Vec<String>, rows: Vec<ResultRow>) -> Self {
        Self {
            group_by,
            labels,
            rows: rows.into_iter(),
        }
    }

    /// Group-by column names
    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    /// Aggregation labels, one per value column
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl Iterator for QueryResult {
    type Item = ResultRow;

    fn next(&mut self) -> Option<ResultRow> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for QueryResult {}
