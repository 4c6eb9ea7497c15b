//! Tree nodes addressed by arena index

use std::fmt;
use std::ops::Range;

use crate::types::DimensionId;

/// Index of a node in the tree arena (the root is 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The root node
    pub const ROOT: NodeId = NodeId(0);

    /// Arena position
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One partition of the segment's records
///
/// A node at depth `d` holds every record whose first `d` split dimensions
/// equal the ids on its path (STAR on a star path). Internal nodes split on
/// split level `d`; their children occupy a contiguous arena range, explicit
/// children ascending by id and the star child (if any) last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Split level this node partitions on, `None` for leaves
    pub split_level: Option<u16>,
    /// Number of split levels fixed on the path from the root
    pub depth: u16,
    /// Id this node carries at its parent's split level (STAR for star nodes
    /// and for the root)
    pub dimension_id: DimensionId,
    /// Arena range of the children
    pub children: Range<u32>,
    /// Range of this node's records in the leaf record buffer (empty unless
    /// the leaf stopped above the last split level)
    pub leaf_records: Range<u32>,
}

impl TreeNode {
    /// Whether the node has no children
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.split_level.is_none()
    }

    /// Whether this is a star child
    #[inline]
    pub fn is_star(&self) -> bool {
        self.dimension_id.is_star()
    }

    /// Number of children, star included
    #[inline]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Child ids in arena order
    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> {
        self.children.clone().map(NodeId)
    }

    /// Whether the node keeps a leaf record buffer
    #[inline]
    pub fn has_leaf_records(&self) -> bool {
        !self.leaf_records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_flags() {
        let leaf = TreeNode {
            split_level: None,
            depth: 2,
            dimension_id: DimensionId::STAR,
            children: 0..0,
            leaf_records: 4..9,
        };
        assert!(leaf.is_leaf());
        assert!(leaf.is_star());
        assert!(leaf.has_leaf_records());
        assert_eq!(leaf.child_ids().count(), 0);
    }

    #[test]
    fn test_child_ids() {
        let node = TreeNode {
            split_level: Some(0),
            depth: 0,
            dimension_id: DimensionId::STAR,
            children: 1..4,
            leaf_records: 0..0,
        };
        let ids: Vec<NodeId> = node.child_ids().collect();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(NodeId(3).to_string(), "#3");
    }
}
