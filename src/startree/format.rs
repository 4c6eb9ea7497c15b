//! Persisted star-tree format
//!
//! A tree serializes into one self-describing buffer that can be queried
//! without rebuilding: [`StarTreeReader`] decodes nodes and records lazily,
//! straight from owned bytes or a memory-mapped file.
//!
//! # Layout
//!
//! ```text
//! ┌────────────────────────────┐ 0
//! │ Header (64 bytes)          │
//! ├────────────────────────────┤ 64
//! │ Manifest (JSON)            │  metadata + build statistics
//! ├────────────────────────────┤ nodes_offset
//! │ Node table (36 B × nodes)  │  arena order, root first
//! ├────────────────────────────┤ leaf_records_offset
//! │ Leaf table (12 B × records)│
//! ├────────────────────────────┤ states_offset
//! │ Record blobs               │  key ids + length-prefixed states
//! └────────────────────────────┘ states_offset + states_len
//! ```
//!
//! # Header
//!
//! | Offset | Size | Field               |
//! |--------|------|---------------------|
//! | 0      | 4    | magic `STRT`        |
//! | 4      | 2    | format version      |
//! | 6      | 2    | flags (reserved, 0) |
//! | 8      | 2    | split dimensions    |
//! | 10     | 2    | aggregators         |
//! | 12     | 4    | node count          |
//! | 16     | 4    | leaf record count   |
//! | 20     | 4    | manifest length     |
//! | 24     | 8    | node table offset   |
//! | 32     | 8    | leaf table offset   |
//! | 40     | 8    | record blob offset  |
//! | 48     | 8    | record blob length  |
//! | 56     | 8    | CRC-64 of bytes 64.. |
//!
//! All integers are little-endian. Blob offsets in the node and leaf tables
//! are relative to the record blob section.

use bytes::Bytes;
use crc::{Crc, CRC_64_ECMA_182};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use super::node::{NodeId, TreeNode};
use super::record::AggregationRecord;
use super::{StarTree, StarTreeMetadata, StarTreeSource, StarTreeStats};
use crate::codec::ByteReader;
use crate::error::{Error, Result};
use crate::types::DimensionId;

/// Magic number (`STRT`)
pub const STARTREE_MAGIC: u32 = 0x5354_5254;

/// Current format version
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

const NODE_ENTRY_SIZE: usize = 36;
const LEAF_ENTRY_SIZE: usize = 12;

/// Split level value marking a leaf in the node table
const LEAF_SPLIT: u16 = u16::MAX;

/// CRC-64-ECMA-182 calculator instance
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

// ============================================================================
// Header
// ============================================================================

/// Decoded fixed-size header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    /// Format version
    pub version: u16,
    /// Reserved flags
    pub flags: u16,
    /// Number of split dimensions
    pub dimensions: u16,
    /// Number of aggregators
    pub pairs: u16,
    /// Nodes in the node table
    pub node_count: u32,
    /// Entries in the leaf table
    pub leaf_record_count: u32,
    /// Manifest length in bytes
    pub manifest_len: u32,
    /// Node table offset
    pub nodes_offset: u64,
    /// Leaf table offset
    pub leaf_records_offset: u64,
    /// Record blob offset
    pub states_offset: u64,
    /// Record blob length
    pub states_len: u64,
    /// CRC-64 of everything after the header
    pub checksum: u64,
}

impl FormatHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&STARTREE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.dimensions.to_le_bytes());
        out.extend_from_slice(&self.pairs.to_le_bytes());
        out.extend_from_slice(&self.node_count.to_le_bytes());
        out.extend_from_slice(&self.leaf_record_count.to_le_bytes());
        out.extend_from_slice(&self.manifest_len.to_le_bytes());
        out.extend_from_slice(&self.nodes_offset.to_le_bytes());
        out.extend_from_slice(&self.leaf_records_offset.to_le_bytes());
        out.extend_from_slice(&self.states_offset.to_le_bytes());
        out.extend_from_slice(&self.states_len.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes, "star-tree header");
        let magic = reader.u32()?;
        if magic != STARTREE_MAGIC {
            return Err(Error::corrupted(format!(
                "invalid magic number: expected 0x{:08x}, got 0x{:08x}",
                STARTREE_MAGIC, magic
            )));
        }
        let header = Self {
            version: reader.u16()?,
            flags: reader.u16()?,
            dimensions: reader.u16()?,
            pairs: reader.u16()?,
            node_count: reader.u32()?,
            leaf_record_count: reader.u32()?,
            manifest_len: reader.u32()?,
            nodes_offset: reader.u64()?,
            leaf_records_offset: reader.u64()?,
            states_offset: reader.u64()?,
            states_len: reader.u64()?,
            checksum: reader.u64()?,
        };
        if header.version == 0 || header.version > FORMAT_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported format version {} (max supported: {})",
                header.version, FORMAT_VERSION
            )));
        }
        Ok(header)
    }

    /// Check that every section lies inside a buffer of `len` bytes, in order
    fn validate_layout(&self, len: usize) -> Result<()> {
        let len = len as u64;
        let nodes_end = self
            .nodes_offset
            .checked_add(self.node_count as u64 * NODE_ENTRY_SIZE as u64);
        let leaves_end = self
            .leaf_records_offset
            .checked_add(self.leaf_record_count as u64 * LEAF_ENTRY_SIZE as u64);
        let states_end = self.states_offset.checked_add(self.states_len);

        let ordered = self.nodes_offset == HEADER_SIZE as u64 + self.manifest_len as u64
            && nodes_end == Some(self.leaf_records_offset)
            && leaves_end == Some(self.states_offset)
            && states_end == Some(len);
        if !ordered {
            return Err(Error::corrupted(format!(
                "section layout does not match a buffer of {} bytes",
                len
            )));
        }
        if self.node_count == 0 {
            return Err(Error::corrupted("tree has no root node"));
        }
        Ok(())
    }
}

/// Metadata and build statistics, stored as JSON after the header
#[derive(Debug, Serialize, Deserialize)]
struct Manifest<'a> {
    metadata: Cow<'a, StarTreeMetadata>,
    stats: StarTreeStats,
}

// ============================================================================
// Writer
// ============================================================================

fn section_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidInput(format!("{} ({}) exceed the format's u32 limit", what, len)))
}

impl StarTree {
    /// Serialize into the persisted format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let aggregators = &self.metadata.aggregators;
        let manifest = serde_json::to_vec(&Manifest {
            metadata: Cow::Borrowed(&self.metadata),
            stats: self.stats,
        })
        .map_err(|e| Error::InvalidInput(format!("failed to encode tree manifest: {}", e)))?;

        let mut states = Vec::new();
        let mut node_table = Vec::with_capacity(self.nodes.len() * NODE_ENTRY_SIZE);
        for (node, record) in self.nodes.iter().zip(&self.node_records) {
            let offset = states.len() as u64;
            record.write_to(&mut states, aggregators)?;
            let len = section_len(states.len() - offset as usize, "record bytes")?;

            node_table.extend_from_slice(&node.split_level.unwrap_or(LEAF_SPLIT).to_le_bytes());
            node_table.extend_from_slice(&node.depth.to_le_bytes());
            node_table.extend_from_slice(&node.dimension_id.raw().to_le_bytes());
            node_table.extend_from_slice(&node.children.start.to_le_bytes());
            node_table.extend_from_slice(&node.children.end.to_le_bytes());
            node_table.extend_from_slice(&node.leaf_records.start.to_le_bytes());
            node_table.extend_from_slice(&node.leaf_records.end.to_le_bytes());
            node_table.extend_from_slice(&offset.to_le_bytes());
            node_table.extend_from_slice(&len.to_le_bytes());
        }

        let mut leaf_table = Vec::with_capacity(self.leaf_records.len() * LEAF_ENTRY_SIZE);
        for record in &self.leaf_records {
            let offset = states.len() as u64;
            record.write_to(&mut states, aggregators)?;
            let len = section_len(states.len() - offset as usize, "record bytes")?;
            leaf_table.extend_from_slice(&offset.to_le_bytes());
            leaf_table.extend_from_slice(&len.to_le_bytes());
        }

        let manifest_len = section_len(manifest.len(), "manifest bytes")?;
        let nodes_offset = (HEADER_SIZE + manifest.len()) as u64;
        let leaf_records_offset = nodes_offset + node_table.len() as u64;
        let states_offset = leaf_records_offset + leaf_table.len() as u64;

        let mut body = Vec::with_capacity(
            manifest.len() + node_table.len() + leaf_table.len() + states.len(),
        );
        body.extend_from_slice(&manifest);
        body.extend_from_slice(&node_table);
        body.extend_from_slice(&leaf_table);
        body.extend_from_slice(&states);

        let header = FormatHeader {
            version: FORMAT_VERSION,
            flags: 0,
            dimensions: self.metadata.dimension_count() as u16,
            pairs: aggregators.len() as u16,
            node_count: section_len(self.nodes.len(), "nodes")?,
            leaf_record_count: section_len(self.leaf_records.len(), "leaf records")?,
            manifest_len,
            nodes_offset,
            leaf_records_offset,
            states_offset,
            states_len: states.len() as u64,
            checksum: CRC64.checksum(&body),
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        header.write_to(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Serialize to a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;

        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            bytes = bytes.len(),
            nodes = self.nodes.len(),
            "Wrote star-tree"
        );
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug)]
enum Backing {
    Owned(Bytes),
    Mapped(Mmap),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Owned(bytes) => &bytes[..],
            Backing::Mapped(mmap) => &mmap[..],
        }
    }
}

/// Read-only view over a serialized star-tree
///
/// Opening validates the header, section layout and checksum once; nodes and
/// records are then decoded on demand. The reader is immutable and `Sync`,
/// so one instance can serve concurrent queries.
///
/// # Example
///
/// ```no_run
/// use kuba_startree::startree::{StarTreeReader, StarTreeSource};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let reader = StarTreeReader::open("/tmp/segment.stree")?;
/// println!("{} nodes", reader.node_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StarTreeReader {
    backing: Backing,
    header: FormatHeader,
    metadata: StarTreeMetadata,
    stats: StarTreeStats,
}

impl StarTreeReader {
    /// Read a tree from owned bytes
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        Self::parse(Backing::Owned(bytes.into()))
    }

    /// Memory-map and read a tree file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;

        // SAFETY: the mapping is read-only and every access is bounds-checked
        // against the validated layout
        let mmap = unsafe { Mmap::map(&file)? };

        #[cfg(unix)]
        mmap.advise(memmap2::Advice::Random)?;

        let reader = Self::parse(Backing::Mapped(mmap))?;
        debug!(
            path = %path.display(),
            nodes = reader.header.node_count,
            leaf_records = reader.header.leaf_record_count,
            "Opened star-tree"
        );
        Ok(reader)
    }

    fn parse(backing: Backing) -> Result<Self> {
        let data = backing.as_slice();
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupted(format!(
                "buffer of {} bytes is shorter than the {}-byte header",
                data.len(),
                HEADER_SIZE
            )));
        }

        let header = FormatHeader::read_from(&data[..HEADER_SIZE])?;
        header.validate_layout(data.len())?;

        let actual = CRC64.checksum(&data[HEADER_SIZE..]);
        if actual != header.checksum {
            return Err(Error::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let manifest_bytes = &data[HEADER_SIZE..header.nodes_offset as usize];
        let manifest: Manifest<'static> = serde_json::from_slice(manifest_bytes)
            .map_err(|e| Error::corrupted(format!("invalid tree manifest: {}", e)))?;
        let metadata = manifest.metadata.into_owned();

        if metadata.dimension_count() != header.dimensions as usize
            || metadata.aggregators.len() != header.pairs as usize
        {
            return Err(Error::corrupted(format!(
                "header declares {} dimensions and {} aggregators, manifest has {} and {}",
                header.dimensions,
                header.pairs,
                metadata.dimension_count(),
                metadata.aggregators.len()
            )));
        }

        Ok(Self {
            backing,
            header,
            metadata,
            stats: manifest.stats,
        })
    }

    /// The decoded header
    pub fn header(&self) -> &FormatHeader {
        &self.header
    }

    /// Build statistics recorded when the tree was written
    pub fn stats(&self) -> &StarTreeStats {
        &self.stats
    }

    /// Size of the serialized tree in bytes
    pub fn size_bytes(&self) -> usize {
        self.backing.as_slice().len()
    }

    /// Decode the whole tree into memory
    pub fn load(&self) -> Result<StarTree> {
        let node_count = self.header.node_count;
        let nodes = (0..node_count)
            .map(|i| self.node(NodeId(i)))
            .collect::<Result<Vec<_>>>()?;
        let node_records = (0..node_count)
            .map(|i| self.node_record(NodeId(i)).map(Cow::into_owned))
            .collect::<Result<Vec<_>>>()?;
        let leaf_records = (0..self.header.leaf_record_count)
            .map(|i| self.leaf_record(i).map(Cow::into_owned))
            .collect::<Result<Vec<_>>>()?;
        Ok(StarTree::from_parts(
            self.metadata.clone(),
            nodes,
            node_records,
            leaf_records,
            self.stats,
        ))
    }

    fn entry(&self, offset: u64, index: u32, size: usize) -> &[u8] {
        let start = offset as usize + index as usize * size;
        &self.backing.as_slice()[start..start + size]
    }

    fn decode_record(&self, offset: u64, len: u32) -> Result<AggregationRecord> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.header.states_len)
            .ok_or_else(|| {
                Error::corrupted(format!(
                    "record blob {}+{} outside the {}-byte record section",
                    offset, len, self.header.states_len
                ))
            })?;
        let base = self.header.states_offset as usize;
        let bytes = &self.backing.as_slice()[base + offset as usize..base + end as usize];
        AggregationRecord::from_bytes(
            bytes,
            self.metadata.dimension_count(),
            &self.metadata.aggregators,
        )
    }

    /// Raw `(state_offset, state_len)` of a node, with the decoded node
    fn decode_node(&self, id: NodeId) -> Result<(TreeNode, u64, u32)> {
        if id.0 >= self.header.node_count {
            return Err(Error::corrupted(format!(
                "node {} out of range ({} nodes)",
                id, self.header.node_count
            )));
        }
        let mut reader = ByteReader::new(
            self.entry(self.header.nodes_offset, id.0, NODE_ENTRY_SIZE),
            "node entry",
        );
        let split_level = reader.u16()?;
        let depth = reader.u16()?;
        let dimension_id = DimensionId(reader.u32()?);
        let children = reader.u32()?..reader.u32()?;
        let leaf_records = reader.u32()?..reader.u32()?;
        let state_offset = reader.u64()?;
        let state_len = reader.u32()?;

        let split_level = (split_level != LEAF_SPLIT).then_some(split_level);
        // Children always follow their parent, which rules out cycles
        let children_ok = children.is_empty()
            || (children.start > id.0
                && children.start < children.end
                && children.end <= self.header.node_count);
        let leaves_ok = leaf_records.start <= leaf_records.end
            && leaf_records.end <= self.header.leaf_record_count;
        let split_ok = split_level.is_some() != children.is_empty()
            && depth as usize <= self.metadata.dimension_count();
        if !(children_ok && leaves_ok && split_ok) {
            return Err(Error::corrupted(format!("node {} has an inconsistent entry", id)));
        }

        Ok((
            TreeNode {
                split_level,
                depth,
                dimension_id,
                children,
                leaf_records,
            },
            state_offset,
            state_len,
        ))
    }
}

impl StarTreeSource for StarTreeReader {
    fn metadata(&self) -> &StarTreeMetadata {
        &self.metadata
    }

    fn node_count(&self) -> usize {
        self.header.node_count as usize
    }

    fn node(&self, id: NodeId) -> Result<TreeNode> {
        self.decode_node(id).map(|(node, _, _)| node)
    }

    fn node_record(&self, id: NodeId) -> Result<Cow<'_, AggregationRecord>> {
        let (_, offset, len) = self.decode_node(id)?;
        self.decode_record(offset, len).map(Cow::Owned)
    }

    fn leaf_record(&self, index: u32) -> Result<Cow<'_, AggregationRecord>> {
        if index >= self.header.leaf_record_count {
            return Err(Error::corrupted(format!(
                "leaf record {} out of range ({} records)",
                index, self.header.leaf_record_count
            )));
        }
        let mut reader = ByteReader::new(
            self.entry(self.header.leaf_records_offset, index, LEAF_ENTRY_SIZE),
            "leaf entry",
        );
        let offset = reader.u64()?;
        let len = reader.u32()?;
        self.decode_record(offset, len).map(Cow::Owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StarTreeIndexConfig;
    use crate::startree::StarTreeBuilder;
    use crate::types::{DataType, DimensionType, EncodedRow, MetricValue, SegmentSchema};

    fn build(max_leaf_records: usize) -> StarTree {
        let schema = SegmentSchema::new()
            .with_dimension("d1", DimensionType::String)
            .with_dimension("d2", DimensionType::Long)
            .with_metric("m", DataType::Float64);
        let config = StarTreeIndexConfig::new(
            &["d1", "d2"],
            &["SUM__m", "MIN__m", "COUNT__*", "DISTINCTCOUNT__m", "PERCENTILETDIGEST__m"],
        )
        .with_max_leaf_records(max_leaf_records)
        .resolve(&schema)
        .unwrap();
        let rows: Vec<EncodedRow> = (0..60u32)
            .map(|i| {
                EncodedRow::new(
                    vec![DimensionId(i % 4), DimensionId(i % 5)],
                    vec![MetricValue::Float64(i as f64 * 0.5)],
                )
            })
            .collect();
        StarTreeBuilder::new(&config).build(&rows).unwrap()
    }

    fn assert_same_tree(a: &StarTree, b: &StarTree) {
        let aggs = &a.metadata().aggregators;
        assert_eq!(a.metadata(), b.metadata());
        assert_eq!(a.nodes(), b.nodes());
        assert_eq!(a.stats(), b.stats());
        for (x, y) in a.node_records().iter().zip(b.node_records()) {
            assert_eq!(x.to_bytes(aggs).unwrap(), y.to_bytes(aggs).unwrap());
        }
        assert_eq!(a.leaf_records().len(), b.leaf_records().len());
    }

    #[test]
    fn test_header_layout() {
        let tree = build(0);
        let bytes = tree.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &STARTREE_MAGIC.to_le_bytes());
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), FORMAT_VERSION);

        let reader = StarTreeReader::from_bytes(bytes.clone()).unwrap();
        let header = reader.header();
        assert_eq!(header.dimensions, 2);
        assert_eq!(header.pairs, 5);
        assert_eq!(header.node_count as usize, tree.nodes().len());
        assert_eq!(reader.size_bytes(), bytes.len());
    }

    #[test]
    fn test_round_trip_with_leaf_buffers() {
        let tree = build(6);
        assert!(tree.stats().leaf_records > 0);
        let reader = StarTreeReader::from_bytes(tree.to_bytes().unwrap()).unwrap();
        assert_same_tree(&tree, &reader.load().unwrap());
        assert_eq!(reader.stats(), tree.stats());
    }

    #[test]
    fn test_reader_lookups_match_memory() {
        let tree = build(0);
        let reader = StarTreeReader::from_bytes(tree.to_bytes().unwrap()).unwrap();
        let root = reader.root().unwrap();
        assert_eq!(root, tree.root().unwrap());
        for id in 0..4 {
            assert_eq!(
                reader.find_child(&root, DimensionId(id)).unwrap(),
                tree.find_child(&root, DimensionId(id)).unwrap()
            );
        }
        assert!(reader.star_child(&root).unwrap().is_some());
        assert!(reader.node(NodeId(u32::MAX)).is_err());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = build(0).to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            StarTreeReader::from_bytes(bytes),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let bytes = build(0).to_bytes().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            StarTreeReader::from_bytes(bad_magic),
            Err(Error::Corrupted(_))
        ));

        let truncated = bytes[..bytes.len() - 10].to_vec();
        assert!(matches!(
            StarTreeReader::from_bytes(truncated),
            Err(Error::Corrupted(_))
        ));
        assert!(StarTreeReader::from_bytes(vec![0u8; 8]).is_err());
    }

    #[test]
    fn test_mapped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.stree");
        let tree = build(2);
        tree.write_to_file(&path).unwrap();

        let reader = StarTreeReader::open(&path).unwrap();
        assert_same_tree(&tree, &reader.load().unwrap());
    }

    #[test]
    fn test_serialization_is_deterministic() {
        assert_eq!(build(3).to_bytes().unwrap(), build(3).to_bytes().unwrap());
    }
}
