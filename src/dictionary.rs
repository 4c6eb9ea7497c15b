//! Per-column dimension dictionaries
//!
//! Each dimension column gets a sorted dictionary mapping raw values to dense
//! ids. Because the dictionary is sorted, id order is value order, which makes
//! group keys produced in id order come out in natural value order too.
//!
//! ```text
//! column "country"       id
//! ┌──────────────┐      ┌───┐
//! │ "CA"         │ ───► │ 0 │
//! │ "DE"         │ ───► │ 1 │
//! │ "US"         │ ───► │ 2 │
//! └──────────────┘      └───┘
//!       STAR (u32::MAX) is never assigned
//! ```
//!
//! Dictionaries are built once per segment and immutable afterwards.

use std::collections::BTreeSet;

use crate::codec::{put_length_prefixed, ByteReader};
use crate::error::{Error, Result};
use crate::types::{DimensionId, DimensionType, DimensionValue, EncodedRow, RawRow, SegmentSchema};

// ============================================================================
// Dictionary builder
// ============================================================================

/// Collects the distinct values of one dimension column
#[derive(Debug, Clone)]
pub struct DictionaryBuilder {
    column: String,
    data_type: DimensionType,
    values: BTreeSet<DimensionValue>,
}

impl DictionaryBuilder {
    /// Start a dictionary for `column` holding values of `data_type`
    pub fn new(column: impl Into<String>, data_type: DimensionType) -> Self {
        Self {
            column: column.into(),
            data_type,
            values: BTreeSet::new(),
        }
    }

    /// Add a value; duplicates are ignored
    pub fn add(&mut self, value: &DimensionValue) -> Result<()> {
        if value.dimension_type() != self.data_type {
            return Err(Error::TypeMismatch {
                column: self.column.clone(),
                expected: self.data_type.to_string(),
                actual: value.dimension_type().to_string(),
            });
        }
        if !self.values.contains(value) {
            self.values.insert(value.clone());
        }
        Ok(())
    }

    /// Freeze into a sorted dictionary
    pub fn build(self) -> Result<DimensionDictionary> {
        // STAR must stay out of the id space
        if self.values.len() >= DimensionId::STAR.raw() as usize {
            return Err(Error::InvalidInput(format!(
                "column '{}' has too many distinct values ({})",
                self.column,
                self.values.len()
            )));
        }
        Ok(DimensionDictionary {
            column: self.column,
            data_type: self.data_type,
            values: self.values.into_iter().collect(),
        })
    }
}

// ============================================================================
// Dictionary
// ============================================================================

/// Sorted bijection between the values of one column and dense ids
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionDictionary {
    column: String,
    data_type: DimensionType,
    /// Sorted, deduplicated; position is the id
    values: Vec<DimensionValue>,
}

impl DimensionDictionary {
    /// Column this dictionary belongs to
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Value type of the column
    pub fn data_type(&self) -> DimensionType {
        self.data_type
    }

    /// Number of distinct values
    pub fn cardinality(&self) -> usize {
        self.values.len()
    }

    /// Id of a value, if present
    pub fn id_of(&self, value: &DimensionValue) -> Option<DimensionId> {
        self.values
            .binary_search(value)
            .ok()
            .map(|pos| DimensionId(pos as u32))
    }

    /// Value of an id; `None` for STAR or out-of-range ids
    pub fn value_of(&self, id: DimensionId) -> Option<&DimensionValue> {
        if id.is_star() {
            return None;
        }
        self.values.get(id.raw() as usize)
    }

    /// Iterate `(id, value)` in id order
    pub fn iter(&self) -> impl Iterator<Item = (DimensionId, &DimensionValue)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(pos, v)| (DimensionId(pos as u32), v))
    }

    /// Serialize to a length-prefixed little-endian buffer
    ///
    /// Layout: `[column][type u8][count u32][values...]` where strings are
    /// length-prefixed UTF-8 and numbers are 8 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16 + self.values.len() * 8);
        put_length_prefixed(&mut out, self.column.as_bytes())?;
        out.push(dimension_type_tag(self.data_type));
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for value in &self.values {
            match value {
                DimensionValue::Long(v) => out.extend_from_slice(&v.to_le_bytes()),
                DimensionValue::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
                DimensionValue::String(s) => put_length_prefixed(&mut out, s.as_bytes())?,
            }
        }
        Ok(out)
    }

    /// Decode a buffer written by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "dimension dictionary");
        let column = decode_utf8(reader.length_prefixed()?)?;
        let data_type = dimension_type_from_tag(reader.u8()?)?;
        let count = reader.u32()? as usize;

        let mut values = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            let value = match data_type {
                DimensionType::Long => DimensionValue::Long(reader.i64()?),
                DimensionType::Double => DimensionValue::Double(reader.f64()?),
                DimensionType::String => {
                    DimensionValue::String(decode_utf8(reader.length_prefixed()?)?)
                }
            };
            if let Some(prev) = values.last() {
                if *prev >= value {
                    return Err(Error::corrupted(format!(
                        "dictionary '{}' is not strictly sorted",
                        column
                    )));
                }
            }
            values.push(value);
        }
        reader.finish()?;

        Ok(Self {
            column,
            data_type,
            values,
        })
    }
}

fn dimension_type_tag(data_type: DimensionType) -> u8 {
    match data_type {
        DimensionType::Long => 0,
        DimensionType::Double => 1,
        DimensionType::String => 2,
    }
}

fn dimension_type_from_tag(tag: u8) -> Result<DimensionType> {
    match tag {
        0 => Ok(DimensionType::Long),
        1 => Ok(DimensionType::Double),
        2 => Ok(DimensionType::String),
        n => Err(Error::corrupted(format!("invalid dimension type tag: {}", n))),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::corrupted(format!("invalid UTF-8 in dictionary: {}", e)))
}

// ============================================================================
// Segment dictionaries
// ============================================================================

/// The dictionaries of every dimension column of one segment
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDictionaries {
    /// In schema dimension order
    dictionaries: Vec<DimensionDictionary>,
}

impl SegmentDictionaries {
    /// Build one dictionary per schema dimension from the raw rows
    pub fn build(schema: &SegmentSchema, rows: &[RawRow]) -> Result<Self> {
        let mut builders: Vec<DictionaryBuilder> = schema
            .dimensions
            .iter()
            .map(|d| DictionaryBuilder::new(d.name.clone(), d.data_type))
            .collect();

        for (row_idx, row) in rows.iter().enumerate() {
            if row.dimensions.len() != builders.len() {
                return Err(Error::InvalidInput(format!(
                    "row {} has {} dimension values, schema declares {}",
                    row_idx,
                    row.dimensions.len(),
                    builders.len()
                )));
            }
            for (builder, value) in builders.iter_mut().zip(&row.dimensions) {
                builder.add(value)?;
            }
        }

        let dictionaries = builders
            .into_iter()
            .map(DictionaryBuilder::build)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dictionaries })
    }

    /// Assemble from prebuilt dictionaries (schema dimension order)
    pub fn from_dictionaries(dictionaries: Vec<DimensionDictionary>) -> Self {
        Self { dictionaries }
    }

    /// Dictionary of a column
    pub fn get(&self, column: &str) -> Option<&DimensionDictionary> {
        self.dictionaries.iter().find(|d| d.column == column)
    }

    /// All dictionaries in schema order
    pub fn dictionaries(&self) -> &[DimensionDictionary] {
        &self.dictionaries
    }

    /// Translate a raw row to ids
    pub fn encode_row(&self, row: &RawRow) -> Result<EncodedRow> {
        if row.dimensions.len() != self.dictionaries.len() {
            return Err(Error::InvalidInput(format!(
                "row has {} dimension values, expected {}",
                row.dimensions.len(),
                self.dictionaries.len()
            )));
        }
        let dimensions = self
            .dictionaries
            .iter()
            .zip(&row.dimensions)
            .map(|(dict, value)| {
                dict.id_of(value).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "value '{}' is not in the dictionary of column '{}'",
                        value, dict.column
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EncodedRow::new(dimensions, row.metrics.clone()))
    }

    /// Translate many raw rows
    pub fn encode_rows(&self, rows: &[RawRow]) -> Result<Vec<EncodedRow>> {
        rows.iter().map(|row| self.encode_row(row)).collect()
    }

    /// Reverse-lookup one id of a column
    pub fn decode(&self, column: &str, id: DimensionId) -> Option<&DimensionValue> {
        self.get(column).and_then(|dict| dict.value_of(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, MetricValue};

    fn country_dict() -> DimensionDictionary {
        let mut builder = DictionaryBuilder::new("country", DimensionType::String);
        for v in ["US", "CA", "US", "DE"] {
            builder.add(&DimensionValue::from(v)).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_sorted_dense_ids() {
        let dict = country_dict();
        assert_eq!(dict.cardinality(), 3);
        assert_eq!(dict.id_of(&"CA".into()), Some(DimensionId(0)));
        assert_eq!(dict.id_of(&"DE".into()), Some(DimensionId(1)));
        assert_eq!(dict.id_of(&"US".into()), Some(DimensionId(2)));
        assert_eq!(dict.id_of(&"FR".into()), None);
        assert_eq!(dict.value_of(DimensionId(2)), Some(&"US".into()));
        assert_eq!(dict.value_of(DimensionId::STAR), None);
        assert_eq!(dict.value_of(DimensionId(3)), None);
    }

    #[test]
    fn test_mixed_types_rejected() {
        let mut builder = DictionaryBuilder::new("age", DimensionType::Long);
        builder.add(&DimensionValue::Long(3)).unwrap();
        let err = builder.add(&DimensionValue::from("three")).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_bytes_round_trip() {
        let dict = country_dict();
        let decoded = DimensionDictionary::from_bytes(&dict.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, dict);

        let mut builder = DictionaryBuilder::new("score", DimensionType::Double);
        builder.add(&DimensionValue::Double(-0.0)).unwrap();
        builder.add(&DimensionValue::Double(0.0)).unwrap();
        let doubles = builder.build().unwrap();
        assert_eq!(doubles.cardinality(), 2);
        let decoded = DimensionDictionary::from_bytes(&doubles.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, doubles);
    }

    #[test]
    fn test_from_bytes_rejects_truncation() {
        let bytes = country_dict().to_bytes().unwrap();
        assert!(DimensionDictionary::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_segment_encode_decode() {
        let schema = SegmentSchema::new()
            .with_dimension("d1", DimensionType::String)
            .with_dimension("d2", DimensionType::Long)
            .with_metric("m", DataType::Int64);
        let rows = vec![
            RawRow::new(vec!["b".into(), 7i64.into()], vec![MetricValue::Int64(1)]),
            RawRow::new(vec!["a".into(), 3i64.into()], vec![MetricValue::Int64(2)]),
        ];
        let dicts = SegmentDictionaries::build(&schema, &rows).unwrap();
        let encoded = dicts.encode_rows(&rows).unwrap();
        assert_eq!(encoded[0].dimensions, vec![DimensionId(1), DimensionId(1)]);
        assert_eq!(encoded[1].dimensions, vec![DimensionId(0), DimensionId(0)]);
        assert_eq!(dicts.decode("d2", DimensionId(1)), Some(&DimensionValue::Long(7)));

        let unknown = RawRow::new(vec!["z".into(), 7i64.into()], vec![]);
        assert!(dicts.encode_row(&unknown).is_err());
    }
}
