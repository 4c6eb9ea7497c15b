//! Star-tree construction
//!
//! # Algorithm
//!
//! 1. Every encoded row becomes a record keyed by its split-dimension ids,
//!    with one singleton state per aggregator. Records are sorted by key and
//!    identical keys merged (pre-aggregation).
//! 2. A node at depth `d` over a sorted record range becomes a leaf when
//!    `d` equals the number of split dimensions or the range holds at most
//!    `max_leaf_records` records. Leaves above the last level keep their
//!    records as a leaf record buffer.
//! 3. Otherwise the node splits on level `d`: one explicit child per distinct
//!    id, plus a star child when there are more than `star_threshold`
//!    distinct ids and the level is not in the skip list. The star child's
//!    records are the node's records with level `d` set to STAR, re-sorted
//!    and re-merged, so nothing under it splits on `d` again.
//! 4. A node's record is the merge of its explicit children's records in id
//!    order. The star child aggregates the same rows, so it is never added on
//!    top of them.
//! 5. The recursive result is flattened breadth-first into the arena, which
//!    keeps each node's children contiguous.
//!
//! Sibling subtrees are independent; above `parallel_min_records` they are
//! built on the rayon pool. Results are collected in id order, so a parallel
//! build produces exactly the same tree as a serial one.

use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::node::TreeNode;
use super::record::AggregationRecord;
use super::{StarTree, StarTreeMetadata, StarTreeStats};
use crate::aggregation::ValueAggregator;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{DimensionId, EncodedRow, GroupKey};

// ============================================================================
// Builder
// ============================================================================

/// Builds one star-tree from one segment's rows
///
/// Construction is single-shot: the second call to [`build`](Self::build)
/// fails with [`Error::BuilderState`], whatever the outcome of the first.
///
/// # Example
///
/// ```rust
/// use kuba_startree::config::StarTreeIndexConfig;
/// use kuba_startree::startree::{StarTreeBuilder, StarTreeSource};
/// use kuba_startree::types::*;
///
/// let schema = SegmentSchema::new()
///     .with_dimension("d1", DimensionType::String)
///     .with_metric("m", DataType::Int64);
/// let config = StarTreeIndexConfig::new(&["d1"], &["SUM__m"])
///     .resolve(&schema)
///     .unwrap();
///
/// let rows = vec![
///     EncodedRow::new(vec![DimensionId(0)], vec![MetricValue::Int64(10)]),
///     EncodedRow::new(vec![DimensionId(1)], vec![MetricValue::Int64(5)]),
/// ];
/// let mut builder = StarTreeBuilder::new(&config);
/// let tree = builder.build(&rows).unwrap();
/// assert_eq!(tree.stats().raw_rows, 2);
/// assert!(builder.build(&rows).is_err());
/// ```
#[derive(Debug)]
pub struct StarTreeBuilder<'a> {
    config: &'a ResolvedConfig,
    built: bool,
}

impl<'a> StarTreeBuilder<'a> {
    /// Create a builder for a resolved configuration
    pub fn new(config: &'a ResolvedConfig) -> Self {
        Self {
            config,
            built: false,
        }
    }

    /// Whether [`build`](Self::build) was already called
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Build the tree over `rows`
    pub fn build(&mut self, rows: &[EncodedRow]) -> Result<StarTree> {
        if self.built {
            return Err(Error::BuilderState(
                "star-tree builder is single-shot and was already used".to_string(),
            ));
        }
        self.built = true;

        let start = Instant::now();
        info!(
            rows = rows.len(),
            split_order = ?self.config.split_order(),
            "Building star-tree"
        );

        let result = self.build_tree(rows);
        let elapsed = start.elapsed();
        metrics::record_build(elapsed.as_secs_f64(), result.is_ok());

        match &result {
            Ok(tree) => {
                let stats = tree.stats();
                metrics::record_nodes(
                    stats.nodes - stats.leaves,
                    stats.leaves,
                    stats.star_nodes,
                );
                info!(
                    rows = stats.raw_rows,
                    records = stats.records,
                    nodes = stats.nodes,
                    leaves = stats.leaves,
                    star_nodes = stats.star_nodes,
                    leaf_records = stats.leaf_records,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Built star-tree"
                );
            }
            Err(e) => warn!(error = %e, "Star-tree build failed"),
        }
        result
    }

    fn build_tree(&self, rows: &[EncodedRow]) -> Result<StarTree> {
        if rows.is_empty() {
            return Err(Error::InvalidInput(
                "cannot build a star-tree over zero rows".to_string(),
            ));
        }
        if self.config.split_order().len() >= u16::MAX as usize {
            return Err(Error::config(format!(
                "{} split dimensions exceed the supported maximum",
                self.config.split_order().len()
            )));
        }

        let aggregators = self.config.aggregators();
        let records = self.encode_records(rows)?;
        let records = sort_and_merge(records, aggregators)?;
        debug!(
            rows = rows.len(),
            records = records.len(),
            "Pre-aggregated segment rows"
        );

        let ctx = BuildContext {
            aggregators,
            dimension_count: self.config.split_order().len(),
            skip_star: self.config.skip_star(),
            star_threshold: self.config.star_threshold(),
            max_leaf_records: self.config.max_leaf_records(),
            parallel: self.config.parallel(),
            parallel_min_records: self.config.parallel_min_records(),
        };
        let root = build_node(&ctx, &records, 0, DimensionId::STAR)?;

        let metadata = StarTreeMetadata {
            split_order: self.config.split_order().to_vec(),
            skip_star_node_creation: self
                .config
                .split_order()
                .iter()
                .zip(self.config.skip_star())
                .filter(|(_, skip)| **skip)
                .map(|(name, _)| name.clone())
                .collect(),
            aggregators: aggregators.to_vec(),
            star_threshold: self.config.star_threshold(),
            max_leaf_records: self.config.max_leaf_records(),
        };

        flatten(root, metadata, rows.len(), records.len())
    }

    /// Rows to singleton records keyed by split-order ids
    fn encode_records(&self, rows: &[EncodedRow]) -> Result<Vec<AggregationRecord>> {
        let schema = self.config.schema();
        let aggregators = self.config.aggregators();
        let metric_columns = self.config.metric_columns();
        let split_dimensions = self.config.split_dimensions();

        rows.iter()
            .enumerate()
            .map(|(row_idx, row)| {
                if row.dimensions.len() != schema.dimensions.len()
                    || row.metrics.len() != schema.metrics.len()
                {
                    return Err(Error::InvalidInput(format!(
                        "row {} has {} dimensions and {} metrics, schema declares {} and {}",
                        row_idx,
                        row.dimensions.len(),
                        row.metrics.len(),
                        schema.dimensions.len(),
                        schema.metrics.len()
                    )));
                }
                if let Some(pos) = row.dimensions.iter().position(|id| id.is_star()) {
                    return Err(Error::InvalidInput(format!(
                        "row {} carries the reserved STAR id in dimension '{}'",
                        row_idx, schema.dimensions[pos].name
                    )));
                }

                let key: GroupKey = split_dimensions.iter().map(|&i| row.dimensions[i]).collect();
                let states = aggregators
                    .iter()
                    .zip(metric_columns)
                    .map(|(aggregator, column)| {
                        aggregator.init(column.map(|c| &row.metrics[c]))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(AggregationRecord::new(key, states))
            })
            .collect()
    }
}

// ============================================================================
// Recursive construction
// ============================================================================

struct BuildContext<'a> {
    aggregators: &'a [ValueAggregator],
    dimension_count: usize,
    skip_star: &'a [bool],
    star_threshold: usize,
    max_leaf_records: usize,
    parallel: bool,
    parallel_min_records: usize,
}

/// A node before flattening
struct BuildNode {
    dimension_id: DimensionId,
    depth: usize,
    record: AggregationRecord,
    children: Vec<BuildNode>,
    leaf_records: Vec<AggregationRecord>,
}

/// Sort records by key and merge identical keys, in input order
fn sort_and_merge(
    mut records: Vec<AggregationRecord>,
    aggregators: &[ValueAggregator],
) -> Result<Vec<AggregationRecord>> {
    records.sort_by(|a, b| a.key().cmp(b.key()));

    let mut merged: Vec<AggregationRecord> = Vec::with_capacity(records.len());
    for record in records {
        match merged.last_mut() {
            Some(last) if last.key() == record.key() => last.merge(&record, aggregators)?,
            _ => merged.push(record),
        }
    }
    Ok(merged)
}

/// Key of a node at `depth`: path ids above, STAR from `depth` on
fn node_key(sample: &[DimensionId], depth: usize) -> GroupKey {
    sample
        .iter()
        .enumerate()
        .map(|(level, id)| if level < depth { *id } else { DimensionId::STAR })
        .collect()
}

/// `records` with `level` collapsed to STAR
fn collapse(
    records: &[AggregationRecord],
    level: usize,
    aggregators: &[ValueAggregator],
) -> Result<Vec<AggregationRecord>> {
    let collapsed = records
        .iter()
        .map(|r| {
            let mut r = r.clone();
            r.key_mut()[level] = DimensionId::STAR;
            r
        })
        .collect();
    sort_and_merge(collapsed, aggregators)
}

/// Merge the states of `records` (non-empty) under `key`
fn merge_all<'r>(
    key: GroupKey,
    mut records: impl Iterator<Item = &'r AggregationRecord>,
    aggregators: &[ValueAggregator],
) -> Result<AggregationRecord> {
    let first = records
        .next()
        .ok_or_else(|| Error::InvalidInput("cannot aggregate an empty partition".to_string()))?;
    let mut record = first.clone().with_key(key);
    for r in records {
        record.merge_states(r.states(), aggregators)?;
    }
    Ok(record)
}

fn build_node(
    ctx: &BuildContext<'_>,
    records: &[AggregationRecord],
    depth: usize,
    dimension_id: DimensionId,
) -> Result<BuildNode> {
    let sample = records
        .first()
        .ok_or_else(|| Error::InvalidInput("cannot build a node over zero records".to_string()))?;
    let key = node_key(sample.key(), depth);

    if depth == ctx.dimension_count || records.len() <= ctx.max_leaf_records {
        let record = merge_all(key, records.iter(), ctx.aggregators)?;
        let leaf_records = if depth == ctx.dimension_count {
            Vec::new()
        } else {
            records.to_vec()
        };
        return Ok(BuildNode {
            dimension_id,
            depth,
            record,
            children: Vec::new(),
            leaf_records,
        });
    }

    // Records share the path prefix and are sorted, so each id is one run
    let level = depth;
    let mut tasks: Vec<(DimensionId, Cow<'_, [AggregationRecord]>)> = Vec::new();
    let mut start = 0;
    while start < records.len() {
        let id = records[start].key()[level];
        let end = start + records[start..].partition_point(|r| r.key()[level] == id);
        tasks.push((id, Cow::Borrowed(&records[start..end])));
        start = end;
    }
    let explicit = tasks.len();
    if explicit > ctx.star_threshold && !ctx.skip_star[level] {
        tasks.push((
            DimensionId::STAR,
            Cow::Owned(collapse(records, level, ctx.aggregators)?),
        ));
    }

    let children = if ctx.parallel && records.len() >= ctx.parallel_min_records {
        tasks
            .par_iter()
            .map(|(id, child_records)| build_node(ctx, child_records, depth + 1, *id))
            .collect::<Result<Vec<_>>>()?
    } else {
        tasks
            .iter()
            .map(|(id, child_records)| build_node(ctx, child_records, depth + 1, *id))
            .collect::<Result<Vec<_>>>()?
    };

    let record = merge_all(
        key,
        children[..explicit].iter().map(|c| &c.record),
        ctx.aggregators,
    )?;

    Ok(BuildNode {
        dimension_id,
        depth,
        record,
        children,
        leaf_records: Vec::new(),
    })
}

// ============================================================================
// Flattening
// ============================================================================

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{} {} exceed the u32 index space", value, what)))
}

/// Lay the tree out breadth-first so every node's children are contiguous
fn flatten(
    root: BuildNode,
    metadata: StarTreeMetadata,
    raw_rows: usize,
    record_count: usize,
) -> Result<StarTree> {
    let mut nodes = Vec::new();
    let mut node_records = Vec::new();
    let mut leaf_records: Vec<AggregationRecord> = Vec::new();
    let mut stats = StarTreeStats {
        raw_rows,
        records: record_count,
        ..Default::default()
    };

    let mut queue = VecDeque::from([root]);
    let mut next_child = 1usize;
    while let Some(node) = queue.pop_front() {
        let child_count = node.children.len();
        let children = to_u32(next_child, "nodes")?..to_u32(next_child + child_count, "nodes")?;
        next_child += child_count;

        let leaf_start = to_u32(leaf_records.len(), "leaf records")?;
        leaf_records.extend(node.leaf_records);
        let leaf_range = leaf_start..to_u32(leaf_records.len(), "leaf records")?;

        let is_leaf = node.children.is_empty();
        if is_leaf {
            stats.leaves += 1;
        }
        if node.depth > 0 && node.dimension_id.is_star() {
            stats.star_nodes += 1;
        }
        stats.max_depth = stats.max_depth.max(node.depth);

        nodes.push(TreeNode {
            split_level: if is_leaf { None } else { Some(node.depth as u16) },
            depth: node.depth as u16,
            dimension_id: node.dimension_id,
            children,
            leaf_records: leaf_range,
        });
        node_records.push(node.record);
        queue.extend(node.children);
    }

    stats.nodes = nodes.len();
    stats.leaf_records = leaf_records.len();
    Ok(StarTree::from_parts(
        metadata,
        nodes,
        node_records,
        leaf_records,
        stats,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateValue;
    use crate::config::StarTreeIndexConfig;
    use crate::startree::{NodeId, StarTreeSource};
    use crate::types::{DataType, DimensionType, MetricValue, SegmentSchema};

    fn schema() -> SegmentSchema {
        SegmentSchema::new()
            .with_dimension("d1", DimensionType::String)
            .with_dimension("d2", DimensionType::String)
            .with_metric("m", DataType::Int64)
    }

    fn row(d1: u32, d2: u32, m: i64) -> EncodedRow {
        EncodedRow::new(
            vec![DimensionId(d1), DimensionId(d2)],
            vec![MetricValue::Int64(m)],
        )
    }

    /// (A,X,10), (A,Y,20), (B,X,5) with A=0, B=1, X=0, Y=1
    fn example_rows() -> Vec<EncodedRow> {
        vec![row(0, 0, 10), row(0, 1, 20), row(1, 0, 5)]
    }

    fn resolved(threshold: usize) -> ResolvedConfig {
        StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m", "MAX__m"])
            .with_star_threshold(threshold)
            .with_max_leaf_records(0)
            .resolve(&schema())
            .unwrap()
    }

    fn sum_of(tree: &StarTree, id: NodeId) -> AggregateValue {
        let record = tree.node_record(id).unwrap();
        tree.metadata().aggregators[0].extract(&record.states()[0], None)
    }

    #[test]
    fn test_root_aggregates_everything() {
        let config = resolved(1);
        let tree = StarTreeBuilder::new(&config).build(&example_rows()).unwrap();
        let root = tree.root_record().unwrap();
        let aggs = &tree.metadata().aggregators;
        assert_eq!(aggs[0].extract(&root.states()[0], None), AggregateValue::Long(35));
        assert_eq!(
            aggs[1].extract(&root.states()[1], None),
            AggregateValue::Metric(MetricValue::Int64(20))
        );
        assert_eq!(root.key(), &[DimensionId::STAR, DimensionId::STAR]);
    }

    #[test]
    fn test_tree_shape_threshold_one() {
        let config = resolved(1);
        let tree = StarTreeBuilder::new(&config).build(&example_rows()).unwrap();

        // root: A, B, * ; A: X, Y, * ; B: X ; *: X, Y, *
        let root = tree.root().unwrap();
        assert_eq!(root.child_count(), 3);
        let a = tree.find_child(&root, DimensionId(0)).unwrap().unwrap();
        let b = tree.find_child(&root, DimensionId(1)).unwrap().unwrap();
        let star = tree.star_child(&root).unwrap().unwrap();

        let a_node = tree.node(a).unwrap();
        assert_eq!(a_node.child_count(), 3);
        assert!(tree.star_child(&a_node).unwrap().is_some());

        let b_node = tree.node(b).unwrap();
        assert_eq!(b_node.child_count(), 1);
        assert!(tree.star_child(&b_node).unwrap().is_none());

        assert_eq!(sum_of(&tree, a), AggregateValue::Long(30));
        assert_eq!(sum_of(&tree, b), AggregateValue::Long(5));
        assert_eq!(sum_of(&tree, star), AggregateValue::Long(35));

        let a_star = tree.star_child(&a_node).unwrap().unwrap();
        assert_eq!(sum_of(&tree, a_star), AggregateValue::Long(30));
        assert_eq!(tree.stats().max_depth, 2);
    }

    #[test]
    fn test_high_threshold_has_no_stars() {
        let config = resolved(10);
        let tree = StarTreeBuilder::new(&config).build(&example_rows()).unwrap();
        assert_eq!(tree.stats().star_nodes, 0);
        assert!(tree.nodes().iter().all(|n| !n.is_star() || n.depth == 0));
    }

    #[test]
    fn test_skip_star_dimension() {
        let config = StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m"])
            .with_star_threshold(1)
            .with_max_leaf_records(0)
            .with_skip_star("d1")
            .resolve(&schema())
            .unwrap();
        let tree = StarTreeBuilder::new(&config).build(&example_rows()).unwrap();
        let root = tree.root().unwrap();
        assert!(tree.star_child(&root).unwrap().is_none());
        assert_eq!(tree.metadata().skip_star_node_creation, vec!["d1".to_string()]);
    }

    #[test]
    fn test_leaf_record_buffer() {
        let config = StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m"])
            .with_max_leaf_records(10)
            .resolve(&schema())
            .unwrap();
        let tree = StarTreeBuilder::new(&config).build(&example_rows()).unwrap();
        assert_eq!(tree.stats().nodes, 1);
        let root = tree.root().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.leaf_records, 0..3);
        assert_eq!(tree.leaf_records().len(), 3);
    }

    #[test]
    fn test_duplicate_keys_pre_aggregated() {
        let config = resolved(1);
        let rows = vec![row(0, 0, 1), row(0, 0, 2), row(0, 0, 3)];
        let tree = StarTreeBuilder::new(&config).build(&rows).unwrap();
        assert_eq!(tree.stats().records, 1);
        assert_eq!(sum_of(&tree, NodeId::ROOT), AggregateValue::Long(6));
    }

    #[test]
    fn test_children_sorted_star_last() {
        let config = resolved(1);
        let rows = vec![row(2, 0, 1), row(0, 1, 1), row(1, 0, 1)];
        let tree = StarTreeBuilder::new(&config).build(&rows).unwrap();
        for node in tree.nodes() {
            let ids: Vec<DimensionId> = node
                .child_ids()
                .map(|c| tree.node(c).unwrap().dimension_id)
                .collect();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "unsorted children {:?}", ids);
        }
    }

    #[test]
    fn test_parallel_matches_serial() {
        let rows: Vec<EncodedRow> = (0..500)
            .map(|i| row(i % 7, (i * 3) % 11, i as i64))
            .collect();
        let serial = StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m", "COUNT__*"])
            .with_max_leaf_records(2)
            .with_parallel(false)
            .resolve(&schema())
            .unwrap();
        let parallel = StarTreeIndexConfig::new(&["d1", "d2"], &["SUM__m", "COUNT__*"])
            .with_max_leaf_records(2)
            .with_parallel(true)
            .with_parallel_min_records(1)
            .resolve(&schema())
            .unwrap();
        let a = StarTreeBuilder::new(&serial).build(&rows).unwrap();
        let b = StarTreeBuilder::new(&parallel).build(&rows).unwrap();
        assert_eq!(a.nodes(), b.nodes());
        assert_eq!(a.stats(), b.stats());
        for (x, y) in a.node_records().iter().zip(b.node_records()) {
            let aggs = &a.metadata().aggregators;
            assert_eq!(x.to_bytes(aggs).unwrap(), y.to_bytes(aggs).unwrap());
        }
    }

    #[test]
    fn test_single_shot() {
        let config = resolved(1);
        let mut builder = StarTreeBuilder::new(&config);
        assert!(builder.build(&[]).is_err());
        assert!(builder.is_built());
        assert!(matches!(
            builder.build(&example_rows()),
            Err(Error::BuilderState(_))
        ));
    }

    #[test]
    fn test_invalid_rows() {
        let config = resolved(1);
        let star_row = EncodedRow::new(
            vec![DimensionId::STAR, DimensionId(0)],
            vec![MetricValue::Int64(1)],
        );
        assert!(matches!(
            StarTreeBuilder::new(&config).build(&[star_row]),
            Err(Error::InvalidInput(_))
        ));

        let wrong_type = EncodedRow::new(
            vec![DimensionId(0), DimensionId(0)],
            vec![MetricValue::Float64(1.0)],
        );
        assert!(matches!(
            StarTreeBuilder::new(&config).build(&[wrong_type]),
            Err(Error::TypeMismatch { .. })
        ));
    }
}
