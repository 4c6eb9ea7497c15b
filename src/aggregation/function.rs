//! Aggregation kinds and function-column pairs
//!
//! A star-tree pre-aggregates a fixed list of `(function, column)` pairs,
//! written `FUNCTION__column` in configuration (`SUM__salary`, `COUNT__*`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Column name standing for "every row" (only valid with COUNT)
pub const STAR_COLUMN: &str = "*";

/// Separator between function and column in the string form
const PAIR_DELIMITER: &str = "__";

/// Aggregation kinds the index can pre-aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AggregationType {
    /// Exact sum
    Sum,
    /// Minimum by native order
    Min,
    /// Maximum by native order
    Max,
    /// Row count
    Count,
    /// Arithmetic mean
    Avg,
    /// Exact distinct count
    DistinctCount,
    /// Approximate distinct count (KMV sketch)
    DistinctCountKmv,
    /// Approximate percentile (q-digest)
    PercentileEst,
    /// Approximate percentile (t-digest)
    PercentileTDigest,
}

impl AggregationType {
    /// All kinds, in declaration order
    pub const ALL: [AggregationType; 9] = [
        AggregationType::Sum,
        AggregationType::Min,
        AggregationType::Max,
        AggregationType::Count,
        AggregationType::Avg,
        AggregationType::DistinctCount,
        AggregationType::DistinctCountKmv,
        AggregationType::PercentileEst,
        AggregationType::PercentileTDigest,
    ];

    /// Canonical upper-case name
    pub fn name(&self) -> &'static str {
        match self {
            AggregationType::Sum => "SUM",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
            AggregationType::Count => "COUNT",
            AggregationType::Avg => "AVG",
            AggregationType::DistinctCount => "DISTINCTCOUNT",
            AggregationType::DistinctCountKmv => "DISTINCTCOUNTKMV",
            AggregationType::PercentileEst => "PERCENTILEEST",
            AggregationType::PercentileTDigest => "PERCENTILETDIGEST",
        }
    }

    /// Whether results are estimates rather than exact values
    pub fn is_approximate(&self) -> bool {
        matches!(
            self,
            AggregationType::DistinctCountKmv
                | AggregationType::PercentileEst
                | AggregationType::PercentileTDigest
        )
    }

    /// Whether the kind answers a quantile
    pub fn is_percentile(&self) -> bool {
        matches!(
            self,
            AggregationType::PercentileEst | AggregationType::PercentileTDigest
        )
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationType {
    type Err = Error;

    /// Case-insensitive; underscores are ignored (`distinct_count` works)
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        AggregationType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == normalized)
            .ok_or_else(|| Error::config(format!("unknown aggregation function '{}'", s)))
    }
}

impl Serialize for AggregationType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for AggregationType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One pre-aggregated `(function, column)` pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionColumnPair {
    function: AggregationType,
    column: String,
}

impl FunctionColumnPair {
    /// Create a pair; `*` is only accepted with COUNT
    pub fn new(function: AggregationType, column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        if column.is_empty() {
            return Err(Error::config(format!("{} pair has an empty column", function)));
        }
        if column == STAR_COLUMN && function != AggregationType::Count {
            return Err(Error::config(format!(
                "'{}' column is only valid with COUNT, got {}",
                STAR_COLUMN, function
            )));
        }
        Ok(Self { function, column })
    }

    /// The `COUNT__*` pair
    pub fn count_star() -> Self {
        Self {
            function: AggregationType::Count,
            column: STAR_COLUMN.to_string(),
        }
    }

    /// Aggregation kind
    pub fn function(&self) -> AggregationType {
        self.function
    }

    /// Metric column (or `*`)
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Whether the pair counts rows rather than reading a column
    pub fn is_star_column(&self) -> bool {
        self.column == STAR_COLUMN
    }
}

impl fmt::Display for FunctionColumnPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.function, PAIR_DELIMITER, self.column)
    }
}

impl FromStr for FunctionColumnPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (function, column) = s.trim().split_once(PAIR_DELIMITER).ok_or_else(|| {
            Error::config(format!(
                "invalid function-column pair '{}': expected FUNCTION{}column",
                s, PAIR_DELIMITER
            ))
        })?;
        Self::new(function.parse()?, column)
    }
}

impl TryFrom<String> for FunctionColumnPair {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FunctionColumnPair> for String {
    fn from(pair: FunctionColumnPair) -> Self {
        pair.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aggregation_type() {
        assert_eq!("sum".parse::<AggregationType>().unwrap(), AggregationType::Sum);
        assert_eq!(
            "distinct_count".parse::<AggregationType>().unwrap(),
            AggregationType::DistinctCount
        );
        assert_eq!(
            "PERCENTILE_EST".parse::<AggregationType>().unwrap(),
            AggregationType::PercentileEst
        );
        assert!("median".parse::<AggregationType>().is_err());
    }

    #[test]
    fn test_pair_round_trip() {
        let pair: FunctionColumnPair = "max__salary".parse().unwrap();
        assert_eq!(pair.function(), AggregationType::Max);
        assert_eq!(pair.column(), "salary");
        assert_eq!(pair.to_string(), "MAX__salary");

        let count: FunctionColumnPair = "COUNT__*".parse().unwrap();
        assert!(count.is_star_column());
        assert_eq!(count, FunctionColumnPair::count_star());
    }

    #[test]
    fn test_pair_keeps_column_underscores() {
        let pair: FunctionColumnPair = "SUM__total__cost".parse().unwrap();
        assert_eq!(pair.column(), "total__cost");
    }

    #[test]
    fn test_invalid_pairs() {
        assert!("SUM".parse::<FunctionColumnPair>().is_err());
        assert!("SUM__*".parse::<FunctionColumnPair>().is_err());
        assert!("SUM__".parse::<FunctionColumnPair>().is_err());
        assert!("BOGUS__x".parse::<FunctionColumnPair>().is_err());
    }

    #[test]
    fn test_pair_serde_as_string() {
        let pair: FunctionColumnPair = "AVG__m".parse().unwrap();
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, "\"AVG__m\"");
        let back: FunctionColumnPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
        assert!(serde_json::from_str::<FunctionColumnPair>("\"SUM__*\"").is_err());
    }
}
