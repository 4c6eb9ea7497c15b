//! Star-tree index: tree arena, builder and persisted format
//!
//! # Architecture
//!
//! ```text
//!                         root (split d1)
//!               ┌──────────────┼──────────────┐
//!            d1=A            d1=B            d1=*
//!          (split d2)      (split d2)      (split d2)
//!        ┌────┼────┐         │          ┌────┼────┐
//!      d2=X d2=Y  d2=*     d2=X       d2=X d2=Y  d2=*
//! ```
//!
//! Every node carries the aggregate of all rows in its partition. A star
//! child (`*`) aggregates the same rows as its explicit siblings with that
//! dimension collapsed, so a query that does not care about `d1` follows the
//! star child instead of visiting every value.
//!
//! Nodes live in one arena indexed by [`NodeId`]; children are contiguous
//! and sorted by dimension id (STAR sorts last), so child lookup is a binary
//! search and the arena maps directly onto the persisted node table.
//!
//! # Key Components
//!
//! - [`StarTreeBuilder`]: single-shot construction from encoded rows
//! - [`StarTree`]: in-memory tree
//! - [`StarTreeReader`]: zero-copy view over a serialized tree (owned bytes
//!   or a memory-mapped file)
//! - [`StarTreeSource`]: read interface both implement; the query evaluator
//!   is generic over it
//! - [`verify()`]: recomputes node records from their children

pub mod builder;
pub mod format;
pub mod node;
pub mod record;
pub mod verify;

pub use builder::StarTreeBuilder;
pub use format::{StarTreeReader, FORMAT_VERSION, HEADER_SIZE, STARTREE_MAGIC};
pub use node::{NodeId, TreeNode};
pub use record::AggregationRecord;
pub use verify::{verify, VerifyReport};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::aggregation::{FunctionColumnPair, ValueAggregator};
use crate::error::{Error, Result};
use crate::types::DimensionId;

// ============================================================================
// Metadata
// ============================================================================

/// Everything needed to interpret a tree without the segment schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarTreeMetadata {
    /// Split dimension names, root first
    pub split_order: Vec<String>,
    /// Split dimensions that never got a star child
    pub skip_star_node_creation: Vec<String>,
    /// One aggregator per pre-aggregated pair, in record state order
    pub aggregators: Vec<ValueAggregator>,
    /// Star threshold used at build time
    pub star_threshold: usize,
    /// Max leaf records used at build time
    pub max_leaf_records: usize,
}

impl StarTreeMetadata {
    /// Number of split dimensions
    pub fn dimension_count(&self) -> usize {
        self.split_order.len()
    }

    /// Split level of a dimension
    pub fn level_of(&self, dimension: &str) -> Option<usize> {
        self.split_order.iter().position(|d| d == dimension)
    }

    /// State index of a pre-aggregated pair
    pub fn pair_index(&self, pair: &FunctionColumnPair) -> Option<usize> {
        self.aggregators.iter().position(|a| a.pair() == pair)
    }

    /// Pre-aggregated pairs
    pub fn pairs(&self) -> impl Iterator<Item = &FunctionColumnPair> + '_ {
        self.aggregators.iter().map(|a| a.pair())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Shape of a built tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarTreeStats {
    /// Input rows
    pub raw_rows: usize,
    /// Distinct split-dimension keys after pre-aggregation
    pub records: usize,
    /// Nodes in the arena
    pub nodes: usize,
    /// Leaf nodes
    pub leaves: usize,
    /// Star nodes
    pub star_nodes: usize,
    /// Records held in leaf record buffers
    pub leaf_records: usize,
    /// Deepest node depth
    pub max_depth: usize,
}

// ============================================================================
// Read interface
// ============================================================================

/// Read access to a star-tree, in memory or serialized
///
/// Implementations are immutable; any number of threads may read concurrently.
pub trait StarTreeSource {
    /// Tree metadata
    fn metadata(&self) -> &StarTreeMetadata;

    /// Number of nodes
    fn node_count(&self) -> usize;

    /// Decode one node
    fn node(&self, id: NodeId) -> Result<TreeNode>;

    /// Pre-aggregated record of a node
    fn node_record(&self, id: NodeId) -> Result<Cow<'_, AggregationRecord>>;

    /// One record of the leaf record buffer
    fn leaf_record(&self, index: u32) -> Result<Cow<'_, AggregationRecord>>;

    /// The root node
    fn root(&self) -> Result<TreeNode> {
        self.node(NodeId::ROOT)
    }

    /// Child of `node` carrying `id` (explicit or STAR), by binary search
    fn find_child(&self, node: &TreeNode, id: DimensionId) -> Result<Option<NodeId>> {
        let (mut lo, mut hi) = (node.children.start, node.children.end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let child = self.node(NodeId(mid))?;
            match child.dimension_id.cmp(&id) {
                std::cmp::Ordering::Equal => return Ok(Some(NodeId(mid))),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// The star child of `node`, if it has one (always the last child)
    fn star_child(&self, node: &TreeNode) -> Result<Option<NodeId>> {
        if node.children.is_empty() {
            return Ok(None);
        }
        let last = NodeId(node.children.end - 1);
        Ok(self.node(last)?.is_star().then_some(last))
    }
}

// ============================================================================
// In-memory tree
// ============================================================================

/// A built star-tree held in memory
#[derive(Debug, Clone)]
pub struct StarTree {
    metadata: StarTreeMetadata,
    nodes: Vec<TreeNode>,
    node_records: Vec<AggregationRecord>,
    leaf_records: Vec<AggregationRecord>,
    stats: StarTreeStats,
}

impl StarTree {
    pub(crate) fn from_parts(
        metadata: StarTreeMetadata,
        nodes: Vec<TreeNode>,
        node_records: Vec<AggregationRecord>,
        leaf_records: Vec<AggregationRecord>,
        stats: StarTreeStats,
    ) -> Self {
        Self {
            metadata,
            nodes,
            node_records,
            leaf_records,
            stats,
        }
    }

    /// Shape statistics
    pub fn stats(&self) -> &StarTreeStats {
        &self.stats
    }

    /// All nodes in arena order
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Node records, parallel to [`nodes`](Self::nodes)
    pub fn node_records(&self) -> &[AggregationRecord] {
        &self.node_records
    }

    /// The leaf record buffer
    pub fn leaf_records(&self) -> &[AggregationRecord] {
        &self.leaf_records
    }

    /// Record of the root (aggregate over the whole segment)
    pub fn root_record(&self) -> Option<&AggregationRecord> {
        self.node_records.first()
    }
}

impl StarTreeSource for StarTree {
    fn metadata(&self) -> &StarTreeMetadata {
        &self.metadata
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, id: NodeId) -> Result<TreeNode> {
        self.nodes
            .get(id.index())
            .cloned()
            .ok_or_else(|| Error::corrupted(format!("node {} out of range", id)))
    }

    fn node_record(&self, id: NodeId) -> Result<Cow<'_, AggregationRecord>> {
        self.node_records
            .get(id.index())
            .map(Cow::Borrowed)
            .ok_or_else(|| Error::corrupted(format!("record of node {} out of range", id)))
    }

    fn leaf_record(&self, index: u32) -> Result<Cow<'_, AggregationRecord>> {
        self.leaf_records
            .get(index as usize)
            .map(Cow::Borrowed)
            .ok_or_else(|| Error::corrupted(format!("leaf record {} out of range", index)))
    }
}
