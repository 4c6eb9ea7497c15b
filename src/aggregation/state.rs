//! Aggregator states and their binary encoding
//!
//! Every state serializes as a one-byte tag followed by a kind-specific
//! payload, so a record's states decode independently of each other.

use std::collections::BTreeSet;

use tdigest::TDigest;

use super::distinct::KmvSketch;
use super::numeric::KahanSum;
use super::quantile_digest::QuantileDigest;
use crate::codec::ByteReader;
use crate::error::{Error, Result};
use crate::types::{DataType, MetricValue};

// ============================================================================
// Aggregator State
// ============================================================================

/// Partial aggregate of one function-column pair over a set of rows
#[derive(Debug, Clone)]
pub enum AggregatorState {
    /// Exact integer sum
    LongSum(i64),

    /// Compensated floating point sum
    DoubleSum(KahanSum),

    /// Minimum value seen, `None` over zero rows
    Min(Option<MetricValue>),

    /// Maximum value seen, `None` over zero rows
    Max(Option<MetricValue>),

    /// Row count
    Count(u64),

    /// Running sum and count for the mean
    Avg {
        /// Sum of values
        sum: KahanSum,
        /// Number of values
        count: u64,
    },

    /// Sortable keys of every distinct value
    DistinctCount(BTreeSet<u64>),

    /// K-minimum-values sketch of the hashed keys
    DistinctCountKmv(KmvSketch),

    /// Q-digest over sortable keys
    PercentileEst(QuantileDigest),

    /// T-digest over finite values
    PercentileTDigest(TDigest),
}

impl AggregatorState {
    /// Short variant name for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            AggregatorState::LongSum(_) => "LongSum",
            AggregatorState::DoubleSum(_) => "DoubleSum",
            AggregatorState::Min(_) => "Min",
            AggregatorState::Max(_) => "Max",
            AggregatorState::Count(_) => "Count",
            AggregatorState::Avg { .. } => "Avg",
            AggregatorState::DistinctCount(_) => "DistinctCount",
            AggregatorState::DistinctCountKmv(_) => "DistinctCountKmv",
            AggregatorState::PercentileEst(_) => "PercentileEst",
            AggregatorState::PercentileTDigest(_) => "PercentileTDigest",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            AggregatorState::LongSum(_) => 1,
            AggregatorState::DoubleSum(_) => 2,
            AggregatorState::Min(_) => 3,
            AggregatorState::Max(_) => 4,
            AggregatorState::Count(_) => 5,
            AggregatorState::Avg { .. } => 6,
            AggregatorState::DistinctCount(_) => 7,
            AggregatorState::DistinctCountKmv(_) => 8,
            AggregatorState::PercentileEst(_) => 9,
            AggregatorState::PercentileTDigest(_) => 10,
        }
    }

    /// Append `[tag][payload]`
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.tag());
        match self {
            AggregatorState::LongSum(v) => out.extend_from_slice(&v.to_le_bytes()),
            AggregatorState::DoubleSum(sum) => write_kahan(out, sum),
            AggregatorState::Min(value) | AggregatorState::Max(value) => match value {
                None => out.push(0),
                Some(v) => {
                    out.push(1);
                    out.push(v.data_type().tag());
                    v.write_le(out);
                }
            },
            AggregatorState::Count(n) => out.extend_from_slice(&n.to_le_bytes()),
            AggregatorState::Avg { sum, count } => {
                write_kahan(out, sum);
                out.extend_from_slice(&count.to_le_bytes());
            }
            AggregatorState::DistinctCount(keys) => {
                out.extend_from_slice(&(keys.len() as u32).to_le_bytes());
                for key in keys {
                    out.extend_from_slice(&key.to_le_bytes());
                }
            }
            AggregatorState::DistinctCountKmv(sketch) => sketch.write_to(out),
            AggregatorState::PercentileEst(digest) => digest.write_to(out),
            AggregatorState::PercentileTDigest(digest) => {
                // Empty digests carry NaN bounds, which JSON cannot represent
                if digest.is_empty() {
                    out.push(0);
                } else if !digest.sum().is_finite() {
                    return Err(Error::InvalidInput(
                        "t-digest sum is not finite".to_string(),
                    ));
                } else {
                    out.push(1);
                    let json = serde_json::to_vec(digest).map_err(|e| {
                        Error::InvalidInput(format!("failed to encode t-digest: {}", e))
                    })?;
                    out.extend_from_slice(&json);
                }
            }
        }
        Ok(())
    }

    /// Decode one state; `tdigest_compression` rebuilds empty t-digests
    pub(crate) fn read_from(bytes: &[u8], tdigest_compression: usize) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "aggregator state");
        let tag = reader.u8()?;
        let state = match tag {
            1 => AggregatorState::LongSum(reader.i64()?),
            2 => AggregatorState::DoubleSum(read_kahan(&mut reader)?),
            3 => AggregatorState::Min(read_optional_metric(&mut reader)?),
            4 => AggregatorState::Max(read_optional_metric(&mut reader)?),
            5 => AggregatorState::Count(reader.u64()?),
            6 => {
                let sum = read_kahan(&mut reader)?;
                let count = reader.u64()?;
                AggregatorState::Avg { sum, count }
            }
            7 => {
                let n = reader.u32()? as usize;
                let mut keys = BTreeSet::new();
                let mut prev: Option<u64> = None;
                for _ in 0..n {
                    let key = reader.u64()?;
                    if prev.map_or(false, |p| p >= key) {
                        return Err(Error::corrupted("distinct keys are not strictly ascending"));
                    }
                    prev = Some(key);
                    keys.insert(key);
                }
                AggregatorState::DistinctCount(keys)
            }
            8 => AggregatorState::DistinctCountKmv(KmvSketch::read_from(&mut reader)?),
            9 => AggregatorState::PercentileEst(QuantileDigest::read_from(&mut reader)?),
            10 => {
                let digest = match reader.u8()? {
                    0 => TDigest::new_with_size(tdigest_compression),
                    1 => {
                        let json = reader.take(reader.remaining())?;
                        serde_json::from_slice(json).map_err(|e| {
                            Error::corrupted(format!("invalid t-digest encoding: {}", e))
                        })?
                    }
                    n => return Err(Error::corrupted(format!("invalid t-digest flag: {}", n))),
                };
                AggregatorState::PercentileTDigest(digest)
            }
            n => return Err(Error::corrupted(format!("unknown aggregator state tag: {}", n))),
        };
        reader.finish()?;
        Ok(state)
    }
}

fn write_kahan(out: &mut Vec<u8>, sum: &KahanSum) {
    let (s, c) = sum.parts();
    out.extend_from_slice(&s.to_bits().to_le_bytes());
    out.extend_from_slice(&c.to_bits().to_le_bytes());
}

fn read_kahan(reader: &mut ByteReader<'_>) -> Result<KahanSum> {
    let sum = reader.f64()?;
    let compensation = reader.f64()?;
    Ok(KahanSum::from_parts(sum, compensation))
}

fn read_optional_metric(reader: &mut ByteReader<'_>) -> Result<Option<MetricValue>> {
    match reader.u8()? {
        0 => Ok(None),
        1 => {
            let data_type = match reader.u8()? {
                0 => DataType::Int32,
                1 => DataType::Int64,
                2 => DataType::Float32,
                3 => DataType::Float64,
                n => return Err(Error::corrupted(format!("invalid data type tag: {}", n))),
            };
            let bytes = reader.take(data_type.width())?;
            Ok(Some(MetricValue::read_le(data_type, bytes)?))
        }
        n => Err(Error::corrupted(format!("invalid presence flag: {}", n))),
    }
}
