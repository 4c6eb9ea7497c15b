//! Core data types used throughout the star-tree index
//!
//! # Key Types
//!
//! - **`DimensionId`**: dense dictionary id of a dimension value, with a
//!   reserved `STAR` sentinel for the wildcard
//! - **`DataType`** / **`MetricValue`**: the native numeric type of a metric
//!   column and a value of that type
//! - **`DimensionValue`**: a raw (un-encoded) dimension value
//! - **`SegmentSchema`**: the dimension and metric columns of one segment
//! - **`RawRow`** / **`EncodedRow`**: a segment row before and after
//!   dictionary encoding
//!
//! # Example
//!
//! ```rust
//! use kuba_startree::types::{DataType, DimensionId, MetricValue};
//!
//! let value = MetricValue::Int64(42);
//! assert_eq!(value.data_type(), DataType::Int64);
//! assert!(DimensionId::STAR.is_star());
//! assert!(!DimensionId(0).is_star());
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ============================================================================
// Dimension ids
// ============================================================================

/// Dictionary id of a dimension value
///
/// Real ids are dense and 0-based. `DimensionId::STAR` (`u32::MAX`) is the
/// wildcard marker and is never handed out by a dictionary; because it is the
/// largest id, a star child always sorts after its explicit siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionId(pub u32);

impl DimensionId {
    /// Wildcard marker ("any value")
    pub const STAR: DimensionId = DimensionId(u32::MAX);

    /// Whether this is the wildcard marker
    #[inline]
    pub fn is_star(self) -> bool {
        self == Self::STAR
    }

    /// Raw id
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_star() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Group key: one id (or STAR) per split dimension, in split order
pub type GroupKey = Vec<DimensionId>;

// ============================================================================
// Metric types
// ============================================================================

/// Native numeric type of a metric column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
}

impl DataType {
    /// Schema name of the type
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int32 => "INT",
            DataType::Int64 => "LONG",
            DataType::Float32 => "FLOAT",
            DataType::Float64 => "DOUBLE",
        }
    }

    /// Whether the type is an integer type
    pub fn is_integral(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    /// Width of the native encoding in bytes
    pub fn width(&self) -> usize {
        match self {
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }

    /// Stable one-byte tag used by binary encodings
    pub(crate) fn tag(&self) -> u8 {
        match self {
            DataType::Int32 => 0,
            DataType::Int64 => 1,
            DataType::Float32 => 2,
            DataType::Float64 => 3,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INT" | "INT32" => Ok(DataType::Int32),
            "LONG" | "INT64" => Ok(DataType::Int64),
            "FLOAT" | "FLOAT32" => Ok(DataType::Float32),
            "DOUBLE" | "FLOAT64" => Ok(DataType::Float64),
            other => Err(Error::config(format!("unknown metric data type '{}'", other))),
        }
    }
}

/// A metric value in its native type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

impl MetricValue {
    /// Type of this value
    pub fn data_type(&self) -> DataType {
        match self {
            MetricValue::Int32(_) => DataType::Int32,
            MetricValue::Int64(_) => DataType::Int64,
            MetricValue::Float32(_) => DataType::Float32,
            MetricValue::Float64(_) => DataType::Float64,
        }
    }

    /// Widen to f64 (lossy above 2^53 for integers)
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int32(v) => v as f64,
            MetricValue::Int64(v) => v as f64,
            MetricValue::Float32(v) => v as f64,
            MetricValue::Float64(v) => v,
        }
    }

    /// Integer value, if this is an integer type
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            MetricValue::Int32(v) => Some(v as i64),
            MetricValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Compare two values of the same type in their native domain
    ///
    /// Integers compare as integers, floats by IEEE-754 total order (so
    /// `-0.0 < +0.0` and NaNs have a fixed place). Returns `None` when the
    /// types differ.
    pub fn native_cmp(&self, other: &MetricValue) -> Option<Ordering> {
        match (self, other) {
            (MetricValue::Int32(a), MetricValue::Int32(b)) => Some(a.cmp(b)),
            (MetricValue::Int64(a), MetricValue::Int64(b)) => Some(a.cmp(b)),
            (MetricValue::Float32(a), MetricValue::Float32(b)) => Some(a.total_cmp(b)),
            (MetricValue::Float64(a), MetricValue::Float64(b)) => Some(a.total_cmp(b)),
            _ => None,
        }
    }

    /// Append the little-endian native encoding
    pub fn write_le(&self, out: &mut Vec<u8>) {
        match *self {
            MetricValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            MetricValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            MetricValue::Float32(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            MetricValue::Float64(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
        }
    }

    /// Decode a little-endian native encoding of the given type
    pub fn read_le(data_type: DataType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != data_type.width() {
            return Err(Error::corrupted(format!(
                "{} value needs {} bytes, got {}",
                data_type,
                data_type.width(),
                bytes.len()
            )));
        }
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];
        Ok(match data_type {
            DataType::Int32 => {
                buf4.copy_from_slice(bytes);
                MetricValue::Int32(i32::from_le_bytes(buf4))
            }
            DataType::Int64 => {
                buf8.copy_from_slice(bytes);
                MetricValue::Int64(i64::from_le_bytes(buf8))
            }
            DataType::Float32 => {
                buf4.copy_from_slice(bytes);
                MetricValue::Float32(f32::from_bits(u32::from_le_bytes(buf4)))
            }
            DataType::Float64 => {
                buf8.copy_from_slice(bytes);
                MetricValue::Float64(f64::from_bits(u64::from_le_bytes(buf8)))
            }
        })
    }

    /// Bitwise equality (distinguishes `-0.0`/`+0.0` and NaN payloads)
    pub fn bit_eq(&self, other: &MetricValue) -> bool {
        self.native_cmp(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int32(v) => write!(f, "{}", v),
            MetricValue::Int64(v) => write!(f, "{}", v),
            MetricValue::Float32(v) => write!(f, "{}", v),
            MetricValue::Float64(v) => write!(f, "{}", v),
        }
    }
}

// ============================================================================
// Dimension values
// ============================================================================

/// Type of a dimension column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DimensionType {
    /// Integer dimension
    Long,
    /// Floating point dimension
    Double,
    /// String dimension
    String,
}

impl fmt::Display for DimensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionType::Long => f.write_str("LONG"),
            DimensionType::Double => f.write_str("DOUBLE"),
            DimensionType::String => f.write_str("STRING"),
        }
    }
}

/// A raw dimension value
///
/// Values are totally ordered so dictionaries can be sorted; doubles use the
/// IEEE-754 total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DimensionValue {
    /// Integer value
    Long(i64),
    /// Floating point value
    Double(f64),
    /// String value
    String(String),
}

impl DimensionValue {
    /// Type of this value
    pub fn dimension_type(&self) -> DimensionType {
        match self {
            DimensionValue::Long(_) => DimensionType::Long,
            DimensionValue::Double(_) => DimensionType::Double,
            DimensionValue::String(_) => DimensionType::String,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DimensionValue::Long(_) => 0,
            DimensionValue::Double(_) => 1,
            DimensionValue::String(_) => 2,
        }
    }
}

impl PartialEq for DimensionValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DimensionValue {}

impl PartialOrd for DimensionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DimensionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (DimensionValue::Long(a), DimensionValue::Long(b)) => a.cmp(b),
            (DimensionValue::Double(a), DimensionValue::Double(b)) => a.total_cmp(b),
            (DimensionValue::String(a), DimensionValue::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Long(v) => write!(f, "{}", v),
            DimensionValue::Double(v) => write!(f, "{}", v),
            DimensionValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for DimensionValue {
    fn from(value: &str) -> Self {
        DimensionValue::String(value.to_string())
    }
}

impl From<String> for DimensionValue {
    fn from(value: String) -> Self {
        DimensionValue::String(value)
    }
}

impl From<i64> for DimensionValue {
    fn from(value: i64) -> Self {
        DimensionValue::Long(value)
    }
}

impl From<f64> for DimensionValue {
    fn from(value: f64) -> Self {
        DimensionValue::Double(value)
    }
}

// ============================================================================
// Schema
// ============================================================================

/// A dimension column declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Column name
    pub name: String,
    /// Value type
    pub data_type: DimensionType,
}

/// A metric column declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Column name
    pub name: String,
    /// Native numeric type
    pub data_type: DataType,
}

/// Columns of one segment, as declared by table configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentSchema {
    /// Dimension columns, in row order
    pub dimensions: Vec<DimensionSpec>,
    /// Metric columns, in row order
    pub metrics: Vec<MetricSpec>,
}

impl SegmentSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dimension column
    pub fn with_dimension(mut self, name: &str, data_type: DimensionType) -> Self {
        self.dimensions.push(DimensionSpec {
            name: name.to_string(),
            data_type,
        });
        self
    }

    /// Add a metric column
    pub fn with_metric(mut self, name: &str, data_type: DataType) -> Self {
        self.metrics.push(MetricSpec {
            name: name.to_string(),
            data_type,
        });
        self
    }

    /// Position of a dimension column
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name == name)
    }

    /// Position of a metric column
    pub fn metric_index(&self, name: &str) -> Option<usize> {
        self.metrics.iter().position(|m| m.name == name)
    }
}

// ============================================================================
// Rows
// ============================================================================

/// A segment row before dictionary encoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// One value per schema dimension
    pub dimensions: Vec<DimensionValue>,
    /// One value per schema metric
    pub metrics: Vec<MetricValue>,
}

impl RawRow {
    /// Create a row
    pub fn new(dimensions: Vec<DimensionValue>, metrics: Vec<MetricValue>) -> Self {
        Self {
            dimensions,
            metrics,
        }
    }
}

/// A dictionary-encoded segment row: the builder's input
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRow {
    /// One id per schema dimension
    pub dimensions: Vec<DimensionId>,
    /// One value per schema metric
    pub metrics: Vec<MetricValue>,
}

impl EncodedRow {
    /// Create a row
    pub fn new(dimensions: Vec<DimensionId>, metrics: Vec<MetricValue>) -> Self {
        Self {
            dimensions,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_sorts_last() {
        let mut ids = vec![DimensionId::STAR, DimensionId(3), DimensionId(0)];
        ids.sort();
        assert_eq!(ids, vec![DimensionId(0), DimensionId(3), DimensionId::STAR]);
        assert_eq!(DimensionId::STAR.to_string(), "*");
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::Int32);
        assert_eq!("LONG".parse::<DataType>().unwrap(), DataType::Int64);
        assert_eq!("Double".parse::<DataType>().unwrap(), DataType::Float64);
        assert!("decimal".parse::<DataType>().is_err());
    }

    #[test]
    fn test_metric_value_native_cmp() {
        let a = MetricValue::Int64(i64::MAX);
        let b = MetricValue::Int64(i64::MAX - 1);
        // Would compare equal if widened to f64
        assert_eq!(a.native_cmp(&b), Some(Ordering::Greater));

        let neg_zero = MetricValue::Float64(-0.0);
        let pos_zero = MetricValue::Float64(0.0);
        assert_eq!(neg_zero.native_cmp(&pos_zero), Some(Ordering::Less));

        assert_eq!(
            MetricValue::Int32(1).native_cmp(&MetricValue::Int64(1)),
            None
        );
    }

    #[test]
    fn test_metric_value_le_round_trip() {
        for value in [
            MetricValue::Int32(i32::MIN),
            MetricValue::Int64(-7),
            MetricValue::Float32(f32::NAN),
            MetricValue::Float64(-0.0),
        ] {
            let mut buf = Vec::new();
            value.write_le(&mut buf);
            let decoded = MetricValue::read_le(value.data_type(), &buf).unwrap();
            assert!(decoded.bit_eq(&value));
        }
        assert!(MetricValue::read_le(DataType::Int64, &[0u8; 3]).is_err());
    }

    #[test]
    fn test_dimension_value_order() {
        let mut values = vec![
            DimensionValue::from("b"),
            DimensionValue::from("a"),
            DimensionValue::from("c"),
        ];
        values.sort();
        assert_eq!(values[0], DimensionValue::from("a"));
        assert!(DimensionValue::Double(-0.0) < DimensionValue::Double(0.0));
        assert!(DimensionValue::Long(5) < DimensionValue::String("0".to_string()));
    }

    #[test]
    fn test_schema_lookup() {
        let schema = SegmentSchema::new()
            .with_dimension("country", DimensionType::String)
            .with_metric("clicks", DataType::Int64);
        assert_eq!(schema.dimension_index("country"), Some(0));
        assert_eq!(schema.metric_index("clicks"), Some(0));
        assert_eq!(schema.metric_index("country"), None);
    }
}
