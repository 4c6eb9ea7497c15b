//! Numeric helpers for aggregation
//!
//! - [`KahanSum`]: compensated floating point summation
//! - [`sortable_key`] / [`from_sortable_key`]: order-preserving mapping of
//!   any metric value into the `u64` key universe used by the sketches
//! - [`mix64`]: 64-bit finalizer used to hash sortable keys

use crate::types::{DataType, MetricValue};

const SIGN_BIT: u64 = 1 << 63;

/// Compensated (Kahan-Babuska) sum
///
/// Keeps the running sum and the accumulated rounding error separately; the
/// value is `sum + compensation`. Merging uses an error-free two-sum, so
/// `a.merge(b)` and `b.merge(a)` produce the same bits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    /// Create a new sum accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a single value
    pub fn from_value(value: f64) -> Self {
        Self {
            sum: value,
            compensation: 0.0,
        }
    }

    /// Rebuild from serialized parts
    pub fn from_parts(sum: f64, compensation: f64) -> Self {
        Self { sum, compensation }
    }

    /// Raw running sum and compensation
    pub fn parts(&self) -> (f64, f64) {
        (self.sum, self.compensation)
    }

    /// Add a value to the sum
    #[inline]
    pub fn add(&mut self, value: f64) {
        let (sum, err) = two_sum(self.sum, value);
        self.sum = sum;
        self.compensation += err;
    }

    /// Get the current sum
    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum + self.compensation
    }

    /// Merge another Kahan sum
    pub fn merge(&mut self, other: &KahanSum) {
        let (sum, err) = two_sum(self.sum, other.sum);
        self.sum = sum;
        self.compensation = (self.compensation + other.compensation) + err;
    }
}

/// Knuth's two-sum: `a + b == s + err` exactly, symmetric in `a` and `b`
#[inline]
fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let s = a + b;
    let bb = s - a;
    let err = (a - (s - bb)) + (b - bb);
    // Inf/NaN operands make the error term meaningless
    if err.is_finite() {
        (s, err)
    } else {
        (s, 0.0)
    }
}

/// Map a metric value to a `u64` whose unsigned order matches the value order
///
/// Integers are sign-flipped; floats are widened to `f64` and mapped with the
/// usual IEEE-754 total-order trick, so `-0.0` sorts before `+0.0`.
pub fn sortable_key(value: &MetricValue) -> u64 {
    match *value {
        MetricValue::Int32(v) => (v as i64 as u64) ^ SIGN_BIT,
        MetricValue::Int64(v) => (v as u64) ^ SIGN_BIT,
        MetricValue::Float32(v) => float_key(v as f64),
        MetricValue::Float64(v) => float_key(v),
    }
}

#[inline]
fn float_key(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    }
}

/// Inverse of [`sortable_key`] for the given type
///
/// Keys that lie between two keys of valid values decode to a value between
/// those two values, so clamped sketch answers always decode in range.
pub fn from_sortable_key(key: u64, data_type: DataType) -> MetricValue {
    match data_type {
        DataType::Int32 => MetricValue::Int32(((key ^ SIGN_BIT) as i64) as i32),
        DataType::Int64 => MetricValue::Int64((key ^ SIGN_BIT) as i64),
        DataType::Float32 => MetricValue::Float32(float_from_key(key) as f32),
        DataType::Float64 => MetricValue::Float64(float_from_key(key)),
    }
}

#[inline]
fn float_from_key(key: u64) -> f64 {
    if key & SIGN_BIT != 0 {
        f64::from_bits(key & !SIGN_BIT)
    } else {
        f64::from_bits(!key)
    }
}

/// SplitMix64 finalizer
#[inline]
pub fn mix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
