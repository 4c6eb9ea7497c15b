//! Q-digest rank sketch over the 64-bit key universe
//!
//! Values are mapped to order-preserving `u64` keys (see
//! [`sortable_key`](super::numeric::sortable_key)). The digest is a sparse
//! binary trie over that universe:
//!
//! ```text
//! level 64  [0 ............................ u64::MAX]
//! level 63  [0 .. 2^63-1]        [2^63 .. u64::MAX]
//!   ...
//! level 0   single keys (exact counts)
//! ```
//!
//! A node `(level, lo)` covers `[lo, lo | (2^level - 1)]`. Only level-0 nodes
//! hold exact keys; compression folds sparse sibling pairs into their parent
//! whenever `parent + left + right <= floor(n / k)`, with `k = ceil(64 / ε)`.
//!
//! Every non-leaf node therefore holds at most `floor(n / k)` values. Merging
//! two digests adds counts node-wise and adds `n`, which keeps that bound. A
//! point of the universe has at most 64 non-leaf ancestors, so the rank of any
//! answer is off by at most `64 · n / k <= ε · n`.

use std::collections::BTreeMap;

use crate::codec::ByteReader;
use crate::error::{Error, Result};

/// Number of levels above the leaves
const MAX_LEVEL: u8 = 64;

/// Compress once the node count passes `NODE_BUDGET_FACTOR * k`, well above
/// the size of a compressed digest, so compressions stay rare
const NODE_BUDGET_FACTOR: usize = 6;

/// Bytes per serialized node: level u8, lo u64, count u64
const NODE_BYTES: usize = 17;

/// Streaming quantile sketch with bounded rank error
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileDigest {
    max_error: f64,
    compression: u64,
    count: u64,
    min: u64,
    max: u64,
    nodes: BTreeMap<(u8, u64), u64>,
}

impl QuantileDigest {
    /// Default maximum relative rank error
    pub const DEFAULT_MAX_ERROR: f64 = 0.05;

    /// Create an empty digest with rank error bound `max_error`
    pub fn new(max_error: f64) -> Result<Self> {
        if !(max_error > 0.0 && max_error < 1.0) {
            return Err(Error::config(format!(
                "percentile max error must be in (0, 1), got {}",
                max_error
            )));
        }
        Ok(Self::with_validated_error(max_error))
    }

    /// Create from an error bound already known to lie in `(0, 1)`
    pub(crate) fn with_validated_error(max_error: f64) -> Self {
        let max_error = if max_error > 0.0 && max_error < 1.0 {
            max_error
        } else {
            Self::DEFAULT_MAX_ERROR
        };
        Self {
            max_error,
            compression: (MAX_LEVEL as f64 / max_error).ceil() as u64,
            count: 0,
            min: u64::MAX,
            max: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// Declared maximum rank error
    pub fn max_error(&self) -> f64 {
        self.max_error
    }

    /// Number of values summarized
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether no value was added
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of trie nodes held
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Smallest key seen
    pub fn min_key(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.min)
    }

    /// Largest key seen
    pub fn max_key(&self) -> Option<u64> {
        (!self.is_empty()).then_some(self.max)
    }

    /// Add one key
    pub fn add(&mut self, key: u64) {
        *self.nodes.entry((0, key)).or_insert(0) += 1;
        self.count += 1;
        self.min = self.min.min(key);
        self.max = self.max.max(key);
        self.maybe_compress();
    }

    /// Fold another digest into this one
    pub fn merge(&mut self, other: &QuantileDigest) -> Result<()> {
        if self.max_error.to_bits() != other.max_error.to_bits() {
            return Err(Error::IncompatibleState(format!(
                "cannot merge q-digests with max error {} and {}",
                self.max_error, other.max_error
            )));
        }
        for (node, count) in &other.nodes {
            *self.nodes.entry(*node).or_insert(0) += count;
        }
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.maybe_compress();
        Ok(())
    }

    /// Key at quantile `q` in `[0, 1]`, clamped to the observed range
    pub fn quantile(&self, q: f64) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let q = if q.is_nan() { 0.5 } else { q.clamp(0.0, 1.0) };
        let target = ((q * self.count as f64).ceil() as u64).clamp(1, self.count);

        let mut ordered: Vec<(u64, u8, u64)> = self
            .nodes
            .iter()
            .map(|(&(level, lo), &count)| (node_hi(level, lo), level, count))
            .collect();
        ordered.sort_unstable();

        let mut seen = 0u64;
        for (hi, _, count) in ordered {
            seen += count;
            if seen >= target {
                return Some(hi.clamp(self.min, self.max));
            }
        }
        Some(self.max)
    }

    fn maybe_compress(&mut self) {
        if self.nodes.len() > NODE_BUDGET_FACTOR * self.compression as usize {
            self.compress();
        }
    }

    /// Fold sparse sibling pairs into their parents, bottom-up
    ///
    /// One pass per level over that level's nodes in key order; folded
    /// parents are carried into the next level's pass.
    pub fn compress(&mut self) {
        let threshold = self.count / self.compression;
        if threshold == 0 {
            return;
        }

        let mut levels: Vec<Vec<(u64, u64)>> = vec![Vec::new(); MAX_LEVEL as usize + 1];
        for (&(level, lo), &count) in &self.nodes {
            levels[level as usize].push((lo, count));
        }

        let mut kept: Vec<((u8, u64), u64)> = Vec::with_capacity(self.nodes.len());
        let mut folded: Vec<(u64, u64)> = Vec::new();
        for level in 0..MAX_LEVEL {
            let current = merge_runs(
                std::mem::take(&mut levels[level as usize]),
                std::mem::take(&mut folded),
            );
            let parents = &levels[level as usize + 1];
            let mut p = 0;
            let mut i = 0;
            while i < current.len() {
                let (lo, count) = current[i];
                let parent = parent_lo(level + 1, lo);
                let (sibling_count, width) = match current.get(i + 1) {
                    Some(&(next, c)) if parent_lo(level + 1, next) == parent => (c, 2),
                    _ => (0, 1),
                };
                while p < parents.len() && parents[p].0 < parent {
                    p += 1;
                }
                let parent_count = match parents.get(p) {
                    Some(&(plo, c)) if plo == parent => c,
                    _ => 0,
                };

                if count + sibling_count + parent_count <= threshold {
                    folded.push((parent, count + sibling_count));
                } else {
                    kept.extend(current[i..i + width].iter().map(|&(lo, c)| ((level, lo), c)));
                }
                i += width;
            }
        }
        let root = merge_runs(std::mem::take(&mut levels[MAX_LEVEL as usize]), folded);
        kept.extend(root.into_iter().map(|(lo, c)| ((MAX_LEVEL, lo), c)));

        // `kept` is sorted by (level, lo)
        self.nodes = kept.into_iter().collect();
    }

    /// Serialize: `[max_error f64][count u64][min u64][max u64][n u32][n × node]`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(36 + self.nodes.len() * NODE_BYTES);
        out.extend_from_slice(&self.max_error.to_bits().to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for (&(level, lo), &count) in &self.nodes {
            out.push(level);
            out.extend_from_slice(&lo.to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
        }
    }

    /// Decode a digest written by [`write_to`](Self::write_to)
    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let max_error = reader.f64()?;
        let mut digest = Self::new(max_error).map_err(|_| {
            Error::corrupted(format!("invalid q-digest max error: {}", max_error))
        })?;
        digest.count = reader.u64()?;
        digest.min = reader.u64()?;
        digest.max = reader.u64()?;

        let n = reader.u32()? as usize;
        if n.saturating_mul(NODE_BYTES) > reader.remaining() {
            return Err(Error::corrupted("q-digest node table is truncated"));
        }
        let mut total = 0u64;
        for _ in 0..n {
            let level = reader.u8()?;
            let lo = reader.u64()?;
            let count = reader.u64()?;
            if level > MAX_LEVEL || parent_lo(level, lo) != lo {
                return Err(Error::corrupted(format!(
                    "invalid q-digest node (level {}, lo {:#x})",
                    level, lo
                )));
            }
            total = total
                .checked_add(count)
                .ok_or_else(|| Error::corrupted("q-digest counts overflow"))?;
            digest.nodes.insert((level, lo), count);
        }
        if total != digest.count {
            return Err(Error::corrupted(format!(
                "q-digest node counts sum to {}, header says {}",
                total, digest.count
            )));
        }
        Ok(digest)
    }
}

/// Lowest key covered by the level-`level` node containing `key`
#[inline]
fn parent_lo(level: u8, key: u64) -> u64 {
    if level >= MAX_LEVEL {
        0
    } else {
        key & !((1u64 << level) - 1)
    }
}

/// Merge two runs sorted by `lo`, adding counts of equal nodes
fn merge_runs(a: Vec<(u64, u64)>, b: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    if b.is_empty() {
        return a;
    }
    if a.is_empty() {
        return b;
    }
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut a, mut b) = (a.into_iter().peekable(), b.into_iter().peekable());
    loop {
        let next = match (a.peek(), b.peek()) {
            (Some(&(la, ca)), Some(&(lb, cb))) => match la.cmp(&lb) {
                std::cmp::Ordering::Less => a.next(),
                std::cmp::Ordering::Greater => b.next(),
                std::cmp::Ordering::Equal => {
                    a.next();
                    b.next();
                    Some((la, ca + cb))
                }
            },
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => break,
        };
        out.extend(next);
    }
    out
}

/// Highest key covered by node `(level, lo)`
#[inline]
fn node_hi(level: u8, lo: u64) -> u64 {
    if level >= MAX_LEVEL {
        u64::MAX
    } else {
        lo | ((1u64 << level) - 1)
    }
}
