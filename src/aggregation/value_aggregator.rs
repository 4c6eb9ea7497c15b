//! Value aggregators: one per function-column pair
//!
//! A `ValueAggregator` is the single dispatch point for every aggregation
//! kind. It knows the pair it serves, the native type of the input column and
//! the sketch parameters, and exposes the same capability set for every kind:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `empty_state` | identity element (zero rows) |
//! | `init` | singleton state from one raw value |
//! | `merge` / `merge_into` | union of two row sets |
//! | `serialize` / `deserialize` | byte encoding of a state |
//! | `extract` | final value of a state |
//!
//! Merges are associative and commutative. Exact kinds are bit-for-bit
//! order independent (float sums up to rounding of the compensated sum);
//! sketches stay within their declared error bound.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use tdigest::TDigest;

use super::distinct::KmvSketch;
use super::function::{AggregationType, FunctionColumnPair};
use super::numeric::{from_sortable_key, mix64, sortable_key, KahanSum};
use super::quantile_digest::QuantileDigest;
use super::state::AggregatorState;
use crate::error::{Error, Result};
use crate::types::{DataType, MetricValue};

/// Quantile used when a percentile is extracted without one
pub const DEFAULT_QUANTILE: f64 = 0.5;

/// Largest magnitude a t-digest accepts: `2^53` such values still sum to a
/// finite `f64`, so no centroid or running sum of a digest can overflow
pub const TDIGEST_MAX_MAGNITUDE: f64 = f64::MAX / 9_007_199_254_740_992.0;

// ============================================================================
// Parameters
// ============================================================================

/// Sketch parameters shared by all aggregators of one index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatorParams {
    /// Rank error bound of PERCENTILEEST digests
    pub percentile_max_error: f64,
    /// Max centroids of PERCENTILETDIGEST digests
    pub tdigest_compression: usize,
    /// Hashes kept by DISTINCTCOUNTKMV sketches
    pub kmv_sketch_size: usize,
}

impl Default for AggregatorParams {
    fn default() -> Self {
        Self {
            percentile_max_error: QuantileDigest::DEFAULT_MAX_ERROR,
            tdigest_compression: 100,
            kmv_sketch_size: 1024,
        }
    }
}

impl AggregatorParams {
    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.percentile_max_error > 0.0 && self.percentile_max_error < 1.0) {
            return Err(Error::config(format!(
                "percentile_max_error must be in (0, 1), got {}",
                self.percentile_max_error
            )));
        }
        if self.tdigest_compression < 10 {
            return Err(Error::config(format!(
                "tdigest_compression must be >= 10, got {}",
                self.tdigest_compression
            )));
        }
        if self.kmv_sketch_size < 16 {
            return Err(Error::config(format!(
                "kmv_sketch_size must be >= 16, got {}",
                self.kmv_sketch_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Final values
// ============================================================================

/// Final value extracted from a state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum AggregateValue {
    /// No rows contributed (MIN/MAX/AVG/percentiles over nothing)
    Null,
    /// Exact integer result
    Long(i64),
    /// Floating point result
    Double(f64),
    /// Count or distinct count
    Count(u64),
    /// A value in the metric's native type
    Metric(MetricValue),
}

impl AggregateValue {
    /// Numeric view, `None` for `Null`
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            AggregateValue::Null => None,
            AggregateValue::Long(v) => Some(v as f64),
            AggregateValue::Double(v) => Some(v),
            AggregateValue::Count(v) => Some(v as f64),
            AggregateValue::Metric(v) => Some(v.as_f64()),
        }
    }
}

impl fmt::Display for AggregateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateValue::Null => f.write_str("null"),
            AggregateValue::Long(v) => write!(f, "{}", v),
            AggregateValue::Double(v) => write!(f, "{}", v),
            AggregateValue::Count(v) => write!(f, "{}", v),
            AggregateValue::Metric(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// Value Aggregator
// ============================================================================

/// Aggregator of one function-column pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueAggregator {
    pair: FunctionColumnPair,
    /// `None` only for `COUNT__*`
    input_type: Option<DataType>,
    params: AggregatorParams,
}

impl ValueAggregator {
    /// Create the aggregator of `pair` over a column of `input_type`
    pub fn new(
        pair: FunctionColumnPair,
        input_type: Option<DataType>,
        params: AggregatorParams,
    ) -> Result<Self> {
        params.validate()?;
        match (pair.is_star_column(), input_type) {
            (true, Some(_)) => {
                return Err(Error::config(format!("{} takes no input column type", pair)))
            }
            (false, None) => {
                return Err(Error::config(format!("{} needs an input column type", pair)))
            }
            _ => {}
        }
        Ok(Self {
            pair,
            input_type,
            params,
        })
    }

    /// The pair this aggregator serves
    pub fn pair(&self) -> &FunctionColumnPair {
        &self.pair
    }

    /// Aggregation kind
    pub fn function(&self) -> AggregationType {
        self.pair.function()
    }

    /// Native type of the input column
    pub fn input_type(&self) -> Option<DataType> {
        self.input_type
    }

    /// Sketch parameters
    pub fn params(&self) -> &AggregatorParams {
        &self.params
    }

    fn integral_input(&self) -> bool {
        self.input_type.map_or(false, |t| t.is_integral())
    }

    /// State over zero rows
    pub fn empty_state(&self) -> AggregatorState {
        match self.function() {
            AggregationType::Sum if self.integral_input() => AggregatorState::LongSum(0),
            AggregationType::Sum => AggregatorState::DoubleSum(KahanSum::new()),
            AggregationType::Min => AggregatorState::Min(None),
            AggregationType::Max => AggregatorState::Max(None),
            AggregationType::Count => AggregatorState::Count(0),
            AggregationType::Avg => AggregatorState::Avg {
                sum: KahanSum::new(),
                count: 0,
            },
            AggregationType::DistinctCount => AggregatorState::DistinctCount(BTreeSet::new()),
            AggregationType::DistinctCountKmv => AggregatorState::DistinctCountKmv(
                KmvSketch::with_validated_k(self.params.kmv_sketch_size),
            ),
            AggregationType::PercentileEst => AggregatorState::PercentileEst(
                QuantileDigest::with_validated_error(self.params.percentile_max_error),
            ),
            AggregationType::PercentileTDigest => AggregatorState::PercentileTDigest(
                TDigest::new_with_size(self.params.tdigest_compression),
            ),
        }
    }

    /// Singleton state from one raw value (`None` for `COUNT__*`)
    pub fn init(&self, value: Option<&MetricValue>) -> Result<AggregatorState> {
        let value = match (self.input_type, value) {
            (None, _) => return Ok(AggregatorState::Count(1)),
            (Some(expected), Some(v)) if v.data_type() == expected => *v,
            (Some(expected), other) => {
                return Err(Error::TypeMismatch {
                    column: self.pair.column().to_string(),
                    expected: expected.to_string(),
                    actual: other.map_or_else(|| "NULL".to_string(), |v| v.data_type().to_string()),
                })
            }
        };

        if self.function() == AggregationType::PercentileTDigest
            && value.as_f64().abs() > TDIGEST_MAX_MAGNITUDE
            && value.as_f64().is_finite()
        {
            return Err(self.overflow());
        }

        Ok(match self.function() {
            AggregationType::Sum => match value.as_i64() {
                Some(v) => AggregatorState::LongSum(v),
                None => AggregatorState::DoubleSum(KahanSum::from_value(value.as_f64())),
            },
            AggregationType::Min => AggregatorState::Min(Some(value)),
            AggregationType::Max => AggregatorState::Max(Some(value)),
            AggregationType::Count => AggregatorState::Count(1),
            AggregationType::Avg => AggregatorState::Avg {
                sum: KahanSum::from_value(value.as_f64()),
                count: 1,
            },
            AggregationType::DistinctCount => {
                AggregatorState::DistinctCount(BTreeSet::from([sortable_key(&value)]))
            }
            AggregationType::DistinctCountKmv => {
                let mut state = self.empty_state();
                if let AggregatorState::DistinctCountKmv(sketch) = &mut state {
                    sketch.add_hash(mix64(sortable_key(&value)));
                }
                state
            }
            AggregationType::PercentileEst => {
                let mut state = self.empty_state();
                if let AggregatorState::PercentileEst(digest) = &mut state {
                    digest.add(sortable_key(&value));
                }
                state
            }
            AggregationType::PercentileTDigest => {
                let digest = TDigest::new_with_size(self.params.tdigest_compression);
                let v = value.as_f64();
                if v.is_finite() {
                    AggregatorState::PercentileTDigest(digest.merge_sorted(vec![v]))
                } else {
                    AggregatorState::PercentileTDigest(digest)
                }
            }
        })
    }

    /// Merge two states into a new one; inputs are untouched
    pub fn merge(&self, a: &AggregatorState, b: &AggregatorState) -> Result<AggregatorState> {
        let mut out = a.clone();
        self.merge_into(&mut out, b)?;
        Ok(out)
    }

    /// Merge `other` into `target`
    pub fn merge_into(&self, target: &mut AggregatorState, other: &AggregatorState) -> Result<()> {
        match (target, other) {
            (AggregatorState::LongSum(a), AggregatorState::LongSum(b)) => {
                *a = a.checked_add(*b).ok_or_else(|| self.overflow())?;
            }
            (AggregatorState::DoubleSum(a), AggregatorState::DoubleSum(b)) => a.merge(b),
            (AggregatorState::Min(a), AggregatorState::Min(b)) => {
                *a = self.pick(*a, *b, std::cmp::Ordering::Less)?;
            }
            (AggregatorState::Max(a), AggregatorState::Max(b)) => {
                *a = self.pick(*a, *b, std::cmp::Ordering::Greater)?;
            }
            (AggregatorState::Count(a), AggregatorState::Count(b)) => {
                *a = a.checked_add(*b).ok_or_else(|| self.overflow())?;
            }
            (
                AggregatorState::Avg { sum, count },
                AggregatorState::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *count = count.checked_add(*other_count).ok_or_else(|| self.overflow())?;
                sum.merge(other_sum);
            }
            (AggregatorState::DistinctCount(a), AggregatorState::DistinctCount(b)) => {
                a.extend(b.iter().copied());
            }
            (AggregatorState::DistinctCountKmv(a), AggregatorState::DistinctCountKmv(b)) => {
                a.merge(b)?;
            }
            (AggregatorState::PercentileEst(a), AggregatorState::PercentileEst(b)) => {
                a.merge(b)?;
            }
            (AggregatorState::PercentileTDigest(a), AggregatorState::PercentileTDigest(b)) => {
                if b.is_empty() {
                    // nothing to add
                } else if a.is_empty() {
                    *a = b.clone();
                } else {
                    let merged = TDigest::merge_digests(vec![a.clone(), b.clone()]);
                    if !merged.sum().is_finite() {
                        return Err(self.overflow());
                    }
                    *a = merged;
                }
            }
            (target, other) => {
                return Err(Error::IncompatibleState(format!(
                    "{}: cannot merge {} into {}",
                    self.pair,
                    other.kind_name(),
                    target.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// Keep whichever side wins `wanted` under the native order
    fn pick(
        &self,
        a: Option<MetricValue>,
        b: Option<MetricValue>,
        wanted: std::cmp::Ordering,
    ) -> Result<Option<MetricValue>> {
        match (a, b) {
            (Some(x), Some(y)) => {
                let ord = x.native_cmp(&y).ok_or_else(|| {
                    Error::IncompatibleState(format!(
                        "{}: cannot compare {} with {}",
                        self.pair,
                        x.data_type(),
                        y.data_type()
                    ))
                })?;
                Ok(Some(if ord == wanted || ord == std::cmp::Ordering::Equal {
                    x
                } else {
                    y
                }))
            }
            (x, None) => Ok(x),
            (None, y) => Ok(y),
        }
    }

    fn overflow(&self) -> Error {
        Error::Overflow {
            function: self.function().to_string(),
            column: self.pair.column().to_string(),
        }
    }

    /// Encode a state
    pub fn serialize(&self, state: &AggregatorState) -> Result<Vec<u8>> {
        self.check_kind(state)?;
        let mut out = Vec::with_capacity(24);
        state.write_to(&mut out)?;
        Ok(out)
    }

    /// Decode a state and check it belongs to this aggregator
    pub fn deserialize(&self, bytes: &[u8]) -> Result<AggregatorState> {
        let state = AggregatorState::read_from(bytes, self.params.tdigest_compression)?;
        self.check_kind(&state).map_err(|_| {
            Error::corrupted(format!(
                "{} state expected for {}, found {}",
                self.empty_state().kind_name(),
                self.pair,
                state.kind_name()
            ))
        })?;
        Ok(state)
    }

    fn check_kind(&self, state: &AggregatorState) -> Result<()> {
        let expected = self.empty_state().tag();
        let value_ok = match state {
            AggregatorState::Min(Some(v)) | AggregatorState::Max(Some(v)) => {
                Some(v.data_type()) == self.input_type
            }
            _ => true,
        };
        if state.tag() != expected || !value_ok {
            return Err(Error::IncompatibleState(format!(
                "{} does not accept a {} state",
                self.pair,
                state.kind_name()
            )));
        }
        Ok(())
    }

    /// Final value; `quantile` in `[0, 1]` applies to percentile kinds
    pub fn extract(&self, state: &AggregatorState, quantile: Option<f64>) -> AggregateValue {
        let q = quantile.unwrap_or(DEFAULT_QUANTILE);
        match state {
            AggregatorState::LongSum(v) => AggregateValue::Long(*v),
            AggregatorState::DoubleSum(sum) => AggregateValue::Double(sum.sum()),
            AggregatorState::Min(v) | AggregatorState::Max(v) => {
                v.map_or(AggregateValue::Null, AggregateValue::Metric)
            }
            AggregatorState::Count(n) => AggregateValue::Count(*n),
            AggregatorState::Avg { sum, count } => {
                if *count == 0 {
                    AggregateValue::Null
                } else {
                    AggregateValue::Double(sum.sum() / *count as f64)
                }
            }
            AggregatorState::DistinctCount(keys) => AggregateValue::Count(keys.len() as u64),
            AggregatorState::DistinctCountKmv(sketch) => AggregateValue::Count(sketch.estimate()),
            AggregatorState::PercentileEst(digest) => {
                match (digest.quantile(q), self.input_type) {
                    (Some(key), Some(data_type)) => {
                        AggregateValue::Metric(from_sortable_key(key, data_type))
                    }
                    _ => AggregateValue::Null,
                }
            }
            AggregatorState::PercentileTDigest(digest) => {
                if digest.is_empty() {
                    AggregateValue::Null
                } else {
                    AggregateValue::Double(digest.estimate_quantile(q.clamp(0.0, 1.0)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(pair: &str, input: Option<DataType>) -> ValueAggregator {
        ValueAggregator::new(pair.parse().unwrap(), input, AggregatorParams::default()).unwrap()
    }

    fn fold(agg: &ValueAggregator, values: &[MetricValue]) -> AggregatorState {
        let mut state = agg.empty_state();
        for v in values {
            let single = agg.init(Some(v)).unwrap();
            agg.merge_into(&mut state, &single).unwrap();
        }
        state
    }

    #[test]
    fn test_sum_int_and_overflow() {
        let agg = aggregator("SUM__m", Some(DataType::Int64));
        let state = fold(&agg, &[MetricValue::Int64(10), MetricValue::Int64(-3)]);
        assert_eq!(agg.extract(&state, None), AggregateValue::Long(7));

        let big = agg.init(Some(&MetricValue::Int64(i64::MAX))).unwrap();
        let one = agg.init(Some(&MetricValue::Int64(1))).unwrap();
        assert!(matches!(agg.merge(&big, &one), Err(Error::Overflow { .. })));
    }

    #[test]
    fn test_type_mismatch() {
        let agg = aggregator("MAX__m", Some(DataType::Int32));
        let err = agg.init(Some(&MetricValue::Float64(1.0))).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert!(agg.init(None).is_err());
    }

    #[test]
    fn test_max_native_long_compare() {
        let agg = aggregator("MAX__m", Some(DataType::Int64));
        let state = fold(
            &agg,
            &[MetricValue::Int64(i64::MAX), MetricValue::Int64(i64::MAX - 1)],
        );
        assert_eq!(
            agg.extract(&state, None),
            AggregateValue::Metric(MetricValue::Int64(i64::MAX))
        );
    }

    #[test]
    fn test_min_float_total_order() {
        let agg = aggregator("MIN__m", Some(DataType::Float64));
        let a = agg.init(Some(&MetricValue::Float64(0.0))).unwrap();
        let b = agg.init(Some(&MetricValue::Float64(-0.0))).unwrap();
        let ab = agg.serialize(&agg.merge(&a, &b).unwrap()).unwrap();
        let ba = agg.serialize(&agg.merge(&b, &a).unwrap()).unwrap();
        assert_eq!(ab, ba);
        let state = agg.deserialize(&ab).unwrap();
        match agg.extract(&state, None) {
            AggregateValue::Metric(v) => assert!(v.bit_eq(&MetricValue::Float64(-0.0))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_count_star_and_overflow() {
        let agg = aggregator("COUNT__*", None);
        let one = agg.init(None).unwrap();
        let two = agg.merge(&one, &one).unwrap();
        assert_eq!(agg.extract(&two, None), AggregateValue::Count(2));

        let max = AggregatorState::Count(u64::MAX);
        assert!(matches!(agg.merge(&max, &one), Err(Error::Overflow { .. })));
        let bytes = agg.serialize(&max).unwrap();
        assert_eq!(
            agg.extract(&agg.deserialize(&bytes).unwrap(), None),
            AggregateValue::Count(u64::MAX)
        );
    }

    #[test]
    fn test_avg_and_empty() {
        let agg = aggregator("AVG__m", Some(DataType::Float32));
        assert_eq!(agg.extract(&agg.empty_state(), None), AggregateValue::Null);
        let state = fold(&agg, &[MetricValue::Float32(1.0), MetricValue::Float32(2.0)]);
        assert_eq!(agg.extract(&state, None), AggregateValue::Double(1.5));
    }

    #[test]
    fn test_distinct_counts() {
        let exact = aggregator("DISTINCTCOUNT__m", Some(DataType::Int32));
        let values: Vec<MetricValue> = [1, 2, 2, 3, 1].into_iter().map(MetricValue::Int32).collect();
        assert_eq!(exact.extract(&fold(&exact, &values), None), AggregateValue::Count(3));

        let kmv = aggregator("DISTINCTCOUNTKMV__m", Some(DataType::Int32));
        assert_eq!(kmv.extract(&fold(&kmv, &values), None), AggregateValue::Count(3));
    }

    #[test]
    fn test_percentile_est_small() {
        let agg = aggregator("PERCENTILEEST__m", Some(DataType::Int64));
        let values: Vec<MetricValue> = (1..=9).map(MetricValue::Int64).collect();
        let state = fold(&agg, &values);
        assert_eq!(
            agg.extract(&state, Some(0.5)),
            AggregateValue::Metric(MetricValue::Int64(5))
        );
        assert_eq!(agg.extract(&agg.empty_state(), None), AggregateValue::Null);
    }

    #[test]
    fn test_tdigest_skips_non_finite() {
        let agg = aggregator("PERCENTILETDIGEST__m", Some(DataType::Float64));
        let state = fold(
            &agg,
            &[
                MetricValue::Float64(f64::NAN),
                MetricValue::Float64(10.0),
                MetricValue::Float64(f64::INFINITY),
            ],
        );
        assert_eq!(agg.extract(&state, Some(0.5)), AggregateValue::Double(10.0));
        let empty_bytes = agg.serialize(&agg.empty_state()).unwrap();
        assert_eq!(
            agg.extract(&agg.deserialize(&empty_bytes).unwrap(), None),
            AggregateValue::Null
        );
    }

    #[test]
    fn test_tdigest_large_values_round_trip() {
        let agg = aggregator("PERCENTILETDIGEST__m", Some(DataType::Float64));
        let values: Vec<MetricValue> = (0..64)
            .map(|i| {
                let sign = if i % 3 == 0 { -1.0 } else { 1.0 };
                MetricValue::Float64(sign * TDIGEST_MAX_MAGNITUDE * (1.0 - i as f64 / 128.0))
            })
            .collect();
        let state = fold(&agg, &values);

        let bytes = agg.serialize(&state).unwrap();
        let back = agg.deserialize(&bytes).unwrap();
        assert_eq!(agg.serialize(&back).unwrap(), bytes);
        for q in [0.0, 0.25, 0.5, 0.99, 1.0] {
            assert_eq!(agg.extract(&back, Some(q)), agg.extract(&state, Some(q)));
        }
    }

    #[test]
    fn test_tdigest_rejects_overflowing_values() {
        let agg = aggregator("PERCENTILETDIGEST__m", Some(DataType::Float64));
        let err = agg.init(Some(&MetricValue::Float64(1e308))).unwrap_err();
        assert!(matches!(err, Error::Overflow { .. }));
        assert!(agg.init(Some(&MetricValue::Float64(-f64::MAX))).is_err());
        assert!(agg.init(Some(&MetricValue::Float64(TDIGEST_MAX_MAGNITUDE))).is_ok());
    }

    #[test]
    fn test_incompatible_states() {
        let sum = aggregator("SUM__m", Some(DataType::Int64));
        let count = aggregator("COUNT__*", None);
        let mut state = sum.empty_state();
        let other = count.init(None).unwrap();
        assert!(matches!(
            sum.merge_into(&mut state, &other),
            Err(Error::IncompatibleState(_))
        ));
        let bytes = count.serialize(&other).unwrap();
        assert!(sum.deserialize(&bytes).is_err());
    }

    #[test]
    fn test_star_column_needs_no_type() {
        let pair: FunctionColumnPair = "COUNT__*".parse().unwrap();
        assert!(ValueAggregator::new(pair, Some(DataType::Int32), AggregatorParams::default()).is_err());
        let pair: FunctionColumnPair = "SUM__m".parse().unwrap();
        assert!(ValueAggregator::new(pair, None, AggregatorParams::default()).is_err());
    }
}
