//! Aggregation records: a group key plus one state per pre-aggregated pair

use crate::aggregation::{AggregatorState, ValueAggregator};
use crate::codec::{put_length_prefixed, ByteReader};
use crate::error::{Error, Result};
use crate::types::{DimensionId, GroupKey};

/// A group key and its aggregate states
///
/// The key has one entry per split dimension (an id or STAR); `states` has
/// one entry per aggregator, in configuration order. Records stored in a tree
/// are never mutated after the build; query-time merges work on copies.
#[derive(Debug, Clone)]
pub struct AggregationRecord {
    key: GroupKey,
    states: Vec<AggregatorState>,
}

impl AggregationRecord {
    /// Create a record
    pub fn new(key: GroupKey, states: Vec<AggregatorState>) -> Self {
        Self { key, states }
    }

    /// Record over zero rows
    pub fn empty(key: GroupKey, aggregators: &[ValueAggregator]) -> Self {
        Self {
            key,
            states: aggregators.iter().map(|a| a.empty_state()).collect(),
        }
    }

    /// Group key
    pub fn key(&self) -> &[DimensionId] {
        &self.key
    }

    /// Aggregate states
    pub fn states(&self) -> &[AggregatorState] {
        &self.states
    }

    /// Replace the key, keeping the states
    pub fn with_key(mut self, key: GroupKey) -> Self {
        self.key = key;
        self
    }

    pub(crate) fn key_mut(&mut self) -> &mut GroupKey {
        &mut self.key
    }

    /// Merge another record with the same key into this one
    pub fn merge(&mut self, other: &AggregationRecord, aggregators: &[ValueAggregator]) -> Result<()> {
        if self.key != other.key {
            return Err(Error::KeyMismatch {
                expected: self.key.iter().map(|id| id.raw()).collect(),
                actual: other.key.iter().map(|id| id.raw()).collect(),
            });
        }
        self.merge_states(&other.states, aggregators)
    }

    /// Merge states regardless of key (rolling children up into a parent)
    pub(crate) fn merge_states(
        &mut self,
        states: &[AggregatorState],
        aggregators: &[ValueAggregator],
    ) -> Result<()> {
        if states.len() != self.states.len() || aggregators.len() != self.states.len() {
            return Err(Error::IncompatibleState(format!(
                "record has {} states, merging {} with {} aggregators",
                self.states.len(),
                states.len(),
                aggregators.len()
            )));
        }
        for ((target, other), aggregator) in self.states.iter_mut().zip(states).zip(aggregators) {
            aggregator.merge_into(target, other)?;
        }
        Ok(())
    }

    /// Encode as `[key ids u32 × dims][per state: u32 len + bytes]`
    pub fn to_bytes(&self, aggregators: &[ValueAggregator]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.key.len() * 4 + self.states.len() * 16);
        self.write_to(&mut out, aggregators)?;
        Ok(out)
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>, aggregators: &[ValueAggregator]) -> Result<()> {
        for id in &self.key {
            out.extend_from_slice(&id.raw().to_le_bytes());
        }
        for (state, aggregator) in self.states.iter().zip(aggregators) {
            put_length_prefixed(out, &aggregator.serialize(state)?)?;
        }
        Ok(())
    }

    /// Decode a record written by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(
        bytes: &[u8],
        dimension_count: usize,
        aggregators: &[ValueAggregator],
    ) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "aggregation record");
        let key = (0..dimension_count)
            .map(|_| reader.u32().map(DimensionId))
            .collect::<Result<Vec<_>>>()?;
        let states = aggregators
            .iter()
            .map(|aggregator| aggregator.deserialize(reader.length_prefixed()?))
            .collect::<Result<Vec<_>>>()?;
        reader.finish()?;
        Ok(Self { key, states })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregateValue, AggregatorParams};
    use crate::types::{DataType, MetricValue};

    fn aggregators() -> Vec<ValueAggregator> {
        vec![
            ValueAggregator::new(
                "SUM__m".parse().unwrap(),
                Some(DataType::Int64),
                AggregatorParams::default(),
            )
            .unwrap(),
            ValueAggregator::new("COUNT__*".parse().unwrap(), None, AggregatorParams::default())
                .unwrap(),
        ]
    }

    fn record(key: &[u32], value: i64) -> AggregationRecord {
        let aggs = aggregators();
        let states = vec![
            aggs[0].init(Some(&MetricValue::Int64(value))).unwrap(),
            aggs[1].init(None).unwrap(),
        ];
        AggregationRecord::new(key.iter().copied().map(DimensionId).collect(), states)
    }

    #[test]
    fn test_merge_same_key() {
        let aggs = aggregators();
        let mut a = record(&[0, 1], 10);
        a.merge(&record(&[0, 1], 5), &aggs).unwrap();
        assert_eq!(aggs[0].extract(&a.states()[0], None), AggregateValue::Long(15));
        assert_eq!(aggs[1].extract(&a.states()[1], None), AggregateValue::Count(2));
    }

    #[test]
    fn test_merge_key_mismatch() {
        let aggs = aggregators();
        let mut a = record(&[0, 1], 10);
        let err = a.merge(&record(&[0, 2], 5), &aggs).unwrap_err();
        match err {
            Error::KeyMismatch { expected, actual } => {
                assert_eq!(expected, vec![0, 1]);
                assert_eq!(actual, vec![0, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
        // untouched on failure
        assert_eq!(aggs[0].extract(&a.states()[0], None), AggregateValue::Long(10));
    }

    #[test]
    fn test_bytes_round_trip() {
        let aggs = aggregators();
        let mut rec = record(&[3, u32::MAX], -4);
        rec.merge(&record(&[3, u32::MAX], 9), &aggs).unwrap();
        let bytes = rec.to_bytes(&aggs).unwrap();
        let back = AggregationRecord::from_bytes(&bytes, 2, &aggs).unwrap();
        assert_eq!(back.key(), &[DimensionId(3), DimensionId::STAR]);
        assert_eq!(back.to_bytes(&aggs).unwrap(), bytes);
        assert!(AggregationRecord::from_bytes(&bytes, 3, &aggs).is_err());
    }
}
