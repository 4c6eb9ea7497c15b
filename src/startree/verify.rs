//! Structural and aggregate consistency checks
//!
//! [`verify`] walks every node of a tree and recomputes what the builder
//! derived: each internal node's record from its explicit children (in id
//! order), and each buffered leaf's record from its leaf records. States are
//! compared on their encoded bytes, so the check holds for sketches too as
//! long as the merge order matches the build.

use tracing::debug;

use super::node::{NodeId, TreeNode};
use super::record::AggregationRecord;
use super::StarTreeSource;
use crate::aggregation::ValueAggregator;
use crate::error::{Error, Result};
use crate::types::DimensionId;

/// Counts gathered by a successful [`verify`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Nodes decoded and checked
    pub nodes: usize,
    /// Internal node records recomputed from their children
    pub merged_nodes: usize,
    /// Leaf buffer records checked
    pub leaf_records: usize,
}

/// Check every node of `source`
///
/// Fails with [`Error::Corrupted`] naming the first node whose shape, key or
/// record disagrees with its children.
pub fn verify<S: StarTreeSource + ?Sized>(source: &S) -> Result<VerifyReport> {
    let aggregators = &source.metadata().aggregators;
    let dimension_count = source.metadata().dimension_count();
    let mut report = VerifyReport::default();

    for index in 0..source.node_count() {
        let id = NodeId(index as u32);
        let node = source.node(id)?;
        let record = source.node_record(id)?;
        report.nodes += 1;

        if record.key().len() != dimension_count {
            return Err(mismatch(id, "key length differs from split dimension count"));
        }

        match node.split_level {
            Some(level) => {
                verify_children(source, id, &node, &record, level as usize, aggregators)?;
                report.merged_nodes += 1;
            }
            None if node.has_leaf_records() => {
                report.leaf_records +=
                    verify_leaf_buffer(source, id, &node, &record, aggregators)?;
            }
            None => {}
        }
    }

    debug!(
        nodes = report.nodes,
        merged_nodes = report.merged_nodes,
        leaf_records = report.leaf_records,
        "Verified star-tree"
    );
    Ok(report)
}

fn verify_children<S: StarTreeSource + ?Sized>(
    source: &S,
    id: NodeId,
    node: &TreeNode,
    record: &AggregationRecord,
    level: usize,
    aggregators: &[ValueAggregator],
) -> Result<()> {
    if node.children.is_empty() {
        return Err(mismatch(id, "internal node without children"));
    }
    if level != node.depth as usize {
        return Err(mismatch(id, "split level differs from depth"));
    }

    let mut merged: Option<AggregationRecord> = None;
    let mut previous: Option<DimensionId> = None;
    for child_id in node.child_ids() {
        let child = source.node(child_id)?;
        if child.depth != node.depth + 1 {
            return Err(mismatch(child_id, "depth is not parent depth + 1"));
        }
        if previous.map_or(false, |p| p >= child.dimension_id) {
            return Err(mismatch(id, "children are not sorted by id"));
        }
        previous = Some(child.dimension_id);

        let child_record = source.node_record(child_id)?;
        let mut expected_key = record.key().to_vec();
        expected_key[level] = child.dimension_id;
        if child_record.key() != expected_key.as_slice() {
            return Err(mismatch(child_id, "key does not extend the parent key"));
        }

        // The star child stands in for its siblings and is not part of the sum
        if child.is_star() {
            continue;
        }
        match merged.as_mut() {
            None => merged = Some(child_record.into_owned().with_key(record.key().to_vec())),
            Some(acc) => acc.merge_states(child_record.states(), aggregators)?,
        }
    }

    let merged = merged.ok_or_else(|| mismatch(id, "no explicit children"))?;
    if merged.to_bytes(aggregators)? != record.to_bytes(aggregators)? {
        return Err(mismatch(id, "record differs from the merge of its children"));
    }
    Ok(())
}

fn verify_leaf_buffer<S: StarTreeSource + ?Sized>(
    source: &S,
    id: NodeId,
    node: &TreeNode,
    record: &AggregationRecord,
    aggregators: &[ValueAggregator],
) -> Result<usize> {
    let depth = node.depth as usize;
    let mut merged: Option<AggregationRecord> = None;
    for index in node.leaf_records.clone() {
        let leaf = source.leaf_record(index)?;
        if leaf.key()[..depth] != record.key()[..depth] {
            return Err(mismatch(id, "leaf record outside the node's path"));
        }
        match merged.as_mut() {
            None => merged = Some(leaf.into_owned().with_key(record.key().to_vec())),
            Some(acc) => acc.merge_states(leaf.states(), aggregators)?,
        }
    }

    let merged = merged.ok_or_else(|| mismatch(id, "empty leaf record buffer"))?;
    if merged.to_bytes(aggregators)? != record.to_bytes(aggregators)? {
        return Err(mismatch(id, "record differs from the merge of its leaf records"));
    }
    Ok(node.leaf_records.len())
}

fn mismatch(id: NodeId, what: &str) -> Error {
    Error::corrupted(format!("node {}: {}", id, what))
}
