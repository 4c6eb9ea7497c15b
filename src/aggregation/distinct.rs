//! K-Minimum-Values distinct count sketch
//!
//! Keeps the `k` smallest 64-bit hashes seen. Below `k` distinct hashes the
//! count is exact; above it the k-th smallest hash gives the estimate
//! `(k - 1) / (h_k / u64::MAX)`.
//!
//! Merging takes the union of both hash sets and keeps the `k` smallest,
//! which is exactly associative and commutative: any merge order of the same
//! inputs yields the same sketch.

use crate::codec::ByteReader;
use crate::error::{Error, Result};

/// KMV distinct-count sketch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmvSketch {
    /// K smallest hash values seen (sorted, smallest first)
    min_values: Vec<u64>,
    /// Maximum number of values to track (k)
    k: usize,
}

impl KmvSketch {
    /// Minimum allowed k
    pub const MIN_K: usize = 2;

    /// Create an empty sketch tracking `k` hashes
    pub fn new(k: usize) -> Result<Self> {
        if k < Self::MIN_K {
            return Err(Error::config(format!(
                "KMV sketch size must be at least {}, got {}",
                Self::MIN_K,
                k
            )));
        }
        Ok(Self {
            min_values: Vec::new(),
            k,
        })
    }

    /// Create from a size already checked by [`AggregatorParams::validate`]
    ///
    /// [`AggregatorParams::validate`]: super::AggregatorParams::validate
    pub(crate) fn with_validated_k(k: usize) -> Self {
        Self {
            min_values: Vec::new(),
            k: k.max(Self::MIN_K),
        }
    }

    /// Sketch size
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of hashes retained
    pub fn retained(&self) -> usize {
        self.min_values.len()
    }

    /// Add a pre-hashed item
    pub fn add_hash(&mut self, hash: u64) {
        match self.min_values.binary_search(&hash) {
            Ok(_) => {}
            Err(pos) => {
                if pos < self.k {
                    self.min_values.insert(pos, hash);
                    self.min_values.truncate(self.k);
                }
            }
        }
    }

    /// Estimate the number of distinct items
    pub fn estimate(&self) -> u64 {
        let n = self.min_values.len();
        if n < self.k {
            return n as u64;
        }

        let kth_hash = self.min_values[self.k - 1];
        let normalized = kth_hash as f64 / u64::MAX as f64;
        if normalized == 0.0 {
            return self.k as u64;
        }
        ((self.k - 1) as f64 / normalized) as u64
    }

    /// Union with another sketch of the same size
    pub fn merge(&mut self, other: &KmvSketch) -> Result<()> {
        if self.k != other.k {
            return Err(Error::IncompatibleState(format!(
                "cannot merge KMV sketches with k={} and k={}",
                self.k, other.k
            )));
        }
        let mut merged = Vec::with_capacity((self.min_values.len() + other.min_values.len()).min(self.k));
        let (mut i, mut j) = (0, 0);
        let (a, b) = (&self.min_values, &other.min_values);
        while merged.len() < self.k && (i < a.len() || j < b.len()) {
            let next = match (a.get(i), b.get(j)) {
                (Some(&x), Some(&y)) if x == y => {
                    i += 1;
                    j += 1;
                    x
                }
                (Some(&x), Some(&y)) if x < y => {
                    i += 1;
                    x
                }
                (Some(_), Some(&y)) => {
                    j += 1;
                    y
                }
                (Some(&x), None) => {
                    i += 1;
                    x
                }
                (None, Some(&y)) => {
                    j += 1;
                    y
                }
                (None, None) => break,
            };
            merged.push(next);
        }
        self.min_values = merged;
        Ok(())
    }

    /// Serialize: `[k u32][n u32][n × u64]`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.k as u32).to_le_bytes());
        out.extend_from_slice(&(self.min_values.len() as u32).to_le_bytes());
        for hash in &self.min_values {
            out.extend_from_slice(&hash.to_le_bytes());
        }
    }

    /// Decode a sketch written by [`write_to`](Self::write_to)
    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let k = reader.u32()? as usize;
        let n = reader.u32()? as usize;
        if k < Self::MIN_K || n > k {
            return Err(Error::corrupted(format!(
                "invalid KMV sketch header: k={}, n={}",
                k, n
            )));
        }
        let mut min_values = Vec::with_capacity(n);
        for _ in 0..n {
            let hash = reader.u64()?;
            if min_values.last().map_or(false, |prev| *prev >= hash) {
                return Err(Error::corrupted("KMV hashes are not strictly ascending"));
            }
            min_values.push(hash);
        }
        Ok(Self { min_values, k })
    }
}
