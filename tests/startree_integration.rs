//! Integration tests for the star-tree index
//!
//! These tests run the complete pipeline:
//! - Dictionary encoding of raw rows
//! - Tree construction with star nodes and leaf record buffers
//! - Persistence to a file and querying through the mapped reader
//! - Fallback classification, determinism and concurrent evaluation

use std::thread;

use kuba_startree::aggregation::{
    AggregateValue, AggregationType, AggregatorState, QuantileDigest,
};
use kuba_startree::config::StarTreeIndexConfig;
use kuba_startree::dictionary::SegmentDictionaries;
use kuba_startree::query::{
    Evaluation, FallbackReason, QueryEvaluator, ResultRow, StarTreeQuery,
};
use kuba_startree::startree::{StarTree, StarTreeBuilder, StarTreeReader, StarTreeSource};
use kuba_startree::types::{
    DataType, DimensionType, DimensionValue, MetricValue, RawRow, SegmentSchema,
};

// ============================================================================
// Helper Functions
// ============================================================================

/// Rows `(A,X,10), (A,Y,20), (B,X,5)`
fn example_segment() -> (SegmentSchema, Vec<RawRow>) {
    let schema = SegmentSchema::new()
        .with_dimension("dim1", DimensionType::String)
        .with_dimension("dim2", DimensionType::String)
        .with_metric("m", DataType::Int64);
    let rows = vec![
        RawRow::new(vec!["A".into(), "X".into()], vec![MetricValue::Int64(10)]),
        RawRow::new(vec!["A".into(), "Y".into()], vec![MetricValue::Int64(20)]),
        RawRow::new(vec!["B".into(), "X".into()], vec![MetricValue::Int64(5)]),
    ];
    (schema, rows)
}

fn build_example() -> (StarTree, SegmentDictionaries) {
    let (schema, rows) = example_segment();
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let config = StarTreeIndexConfig::new(&["dim1", "dim2"], &["SUM__m", "MAX__m"])
        .with_star_threshold(1)
        .with_max_leaf_records(0)
        .resolve(&schema)
        .expect("config");
    let tree = StarTreeBuilder::new(&config)
        .build(&dictionaries.encode_rows(&rows).expect("encode"))
        .expect("build");
    (tree, dictionaries)
}

/// A larger segment: country × browser × os, with clicks and latency
fn web_segment(rows: usize) -> (SegmentSchema, Vec<RawRow>) {
    let schema = SegmentSchema::new()
        .with_dimension("country", DimensionType::String)
        .with_dimension("browser", DimensionType::String)
        .with_dimension("os", DimensionType::Long)
        .with_metric("clicks", DataType::Int64)
        .with_metric("latency", DataType::Float64);
    let countries = ["br", "de", "fr", "in", "jp", "us"];
    let browsers = ["chrome", "edge", "firefox", "safari"];
    let rows = (0..rows)
        .map(|i| {
            RawRow::new(
                vec![
                    countries[(i * 7) % countries.len()].into(),
                    browsers[(i * 3) % browsers.len()].into(),
                    DimensionValue::Long((i % 5) as i64),
                ],
                vec![
                    MetricValue::Int64((i % 17) as i64),
                    MetricValue::Float64((i % 101) as f64 * 1.5),
                ],
            )
        })
        .collect();
    (schema, rows)
}

fn web_config() -> StarTreeIndexConfig {
    StarTreeIndexConfig::new(
        &["country", "browser", "os"],
        &[
            "SUM__clicks",
            "COUNT__*",
            "MAX__latency",
            "PERCENTILEEST__latency",
            "DISTINCTCOUNT__clicks",
        ],
    )
    .with_star_threshold(2)
    .with_max_leaf_records(8)
}

fn answered<S: StarTreeSource>(
    source: &S,
    dictionaries: &SegmentDictionaries,
    query: &StarTreeQuery,
) -> Vec<ResultRow> {
    match QueryEvaluator::new(source, dictionaries)
        .evaluate(query)
        .expect("evaluate")
    {
        Evaluation::Answered(result) => result.collect(),
        Evaluation::FallbackRequired(reason) => panic!("unexpected fallback: {}", reason),
    }
}

// ============================================================================
// Worked example
// ============================================================================

#[test]
fn test_example_root_aggregates() {
    let (tree, _) = build_example();
    let root = tree.root_record().expect("root record");
    let aggregators = &tree.metadata().aggregators;
    assert_eq!(
        aggregators[0].extract(&root.states()[0], None),
        AggregateValue::Long(35)
    );
    assert_eq!(
        aggregators[1].extract(&root.states()[1], None),
        AggregateValue::Metric(MetricValue::Int64(20))
    );
}

#[test]
fn test_example_group_by_dim1() {
    let (tree, dictionaries) = build_example();
    let query = StarTreeQuery::new()
        .group_by(["dim1"])
        .aggregate(AggregationType::Sum, "m")
        .aggregate(AggregationType::Max, "m");
    let rows = answered(&tree, &dictionaries, &query);

    let rendered: Vec<(DimensionValue, AggregateValue, AggregateValue)> = rows
        .into_iter()
        .map(|r| (r.group_values[0].clone(), r.values[0], r.values[1]))
        .collect();
    assert_eq!(
        rendered,
        vec![
            (
                DimensionValue::from("A"),
                AggregateValue::Long(30),
                AggregateValue::Metric(MetricValue::Int64(20))
            ),
            (
                DimensionValue::from("B"),
                AggregateValue::Long(5),
                AggregateValue::Metric(MetricValue::Int64(5))
            ),
        ]
    );
}

#[test]
fn test_missing_predicate_value_returns_zero_rows() {
    let (tree, dictionaries) = build_example();
    let evaluator = QueryEvaluator::new(&tree, &dictionaries);

    for query in [
        StarTreeQuery::new()
            .filter_eq("dim1", "C")
            .aggregate(AggregationType::Sum, "m"),
        StarTreeQuery::new()
            .group_by(["dim2"])
            .filter_in("dim1", ["Q", "R"])
            .aggregate(AggregationType::Sum, "m"),
    ] {
        assert!(evaluator.can_answer(&query));
        let result = evaluator
            .evaluate(&query)
            .expect("evaluate")
            .into_result()
            .expect("answered");
        assert_eq!(result.count(), 0);
    }
}

#[test]
fn test_fallback_classification() {
    let (tree, dictionaries) = build_example();
    let evaluator = QueryEvaluator::new(&tree, &dictionaries);

    let cases = [
        (
            StarTreeQuery::new()
                .group_by(["dim3"])
                .aggregate(AggregationType::Sum, "m"),
            FallbackReason::UnknownDimension("dim3".to_string()),
        ),
        (
            StarTreeQuery::new()
                .filter_range("dim1", Some("A".into()), Some("B".into()))
                .aggregate(AggregationType::Sum, "m"),
            FallbackReason::RangePredicate("dim1".to_string()),
        ),
        (
            StarTreeQuery::new().aggregate(AggregationType::Min, "m"),
            FallbackReason::UnsupportedAggregation("MIN(m)".to_string()),
        ),
        (StarTreeQuery::new().group_by(["dim1"]), FallbackReason::NoAggregations),
    ];
    for (query, expected) in cases {
        assert!(!evaluator.can_answer(&query));
        match evaluator.evaluate(&query).expect("evaluate") {
            Evaluation::FallbackRequired(reason) => assert_eq!(reason, expected),
            Evaluation::Answered(_) => panic!("expected fallback for {:?}", query),
        }
    }
}

// ============================================================================
// Determinism and concurrency
// ============================================================================

#[test]
fn test_repeated_evaluation_is_identical() {
    let (schema, rows) = web_segment(2_000);
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let config = web_config().resolve(&schema).expect("config");
    let tree = StarTreeBuilder::new(&config)
        .build(&dictionaries.encode_rows(&rows).expect("encode"))
        .expect("build");

    let query = StarTreeQuery::new()
        .group_by(["browser", "country"])
        .filter_in("os", [1i64, 3])
        .aggregate(AggregationType::Sum, "clicks")
        .percentile(AggregationType::PercentileEst, "latency", 0.9)
        .count_star();

    let first = answered(&tree, &dictionaries, &query);
    let second = answered(&tree, &dictionaries, &query);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_rebuild_is_byte_identical() {
    let (schema, rows) = web_segment(1_000);
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let encoded = dictionaries.encode_rows(&rows).expect("encode");

    let serial = web_config()
        .with_parallel(false)
        .resolve(&schema)
        .expect("config");
    let parallel = web_config()
        .with_parallel(true)
        .with_parallel_min_records(1)
        .resolve(&schema)
        .expect("config");

    let a = StarTreeBuilder::new(&serial).build(&encoded).expect("build");
    let b = StarTreeBuilder::new(&parallel).build(&encoded).expect("build");
    assert_eq!(a.to_bytes().expect("bytes"), b.to_bytes().expect("bytes"));
}

#[test]
fn test_concurrent_queries_share_one_tree() {
    let (schema, rows) = web_segment(3_000);
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let config = web_config().resolve(&schema).expect("config");
    let tree = StarTreeBuilder::new(&config)
        .build(&dictionaries.encode_rows(&rows).expect("encode"))
        .expect("build");

    let query = StarTreeQuery::new()
        .group_by(["country"])
        .aggregate(AggregationType::Sum, "clicks")
        .count_star();
    let expected = answered(&tree, &dictionaries, &query);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| answered(&tree, &dictionaries, &query)))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("query thread"), expected);
        }
    });
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_query_over_mapped_file() {
    let (schema, rows) = web_segment(1_500);
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let config = web_config().resolve(&schema).expect("config");
    let tree = StarTreeBuilder::new(&config)
        .build(&dictionaries.encode_rows(&rows).expect("encode"))
        .expect("build");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("web.stree");
    tree.write_to_file(&path).expect("write");
    let reader = StarTreeReader::open(&path).expect("open");
    assert_eq!(reader.stats(), tree.stats());

    let queries = [
        StarTreeQuery::new()
            .group_by(["os"])
            .aggregate(AggregationType::Sum, "clicks")
            .aggregate(AggregationType::Max, "latency"),
        StarTreeQuery::new()
            .group_by(["country", "browser"])
            .filter_eq("os", 2i64)
            .aggregate(AggregationType::DistinctCount, "clicks")
            .count_star(),
        StarTreeQuery::new()
            .filter_eq("browser", "safari")
            .percentile(AggregationType::PercentileEst, "latency", 0.5),
    ];
    for query in &queries {
        assert_eq!(
            answered(&reader, &dictionaries, query),
            answered(&tree, &dictionaries, query)
        );
    }
}

// ============================================================================
// Approximate aggregation
// ============================================================================

/// Estimated value of a single-row PERCENTILEEST answer
fn percentile_of(
    tree: &StarTree,
    dictionaries: &SegmentDictionaries,
    query: StarTreeQuery,
) -> i64 {
    let rows = answered(tree, dictionaries, &query);
    assert_eq!(rows.len(), 1);
    match rows[0].values[0] {
        AggregateValue::Metric(MetricValue::Int64(v)) => v,
        ref other => panic!("unexpected value {:?}", other),
    }
}

/// Number of `sorted` values `<= value` must be within `εm + 1` of `⌈q·m⌉`
fn assert_rank_within(sorted: &[i64], value: i64, q: f64, max_error: f64) {
    let m = sorted.len();
    let rank = sorted.partition_point(|&v| v <= value);
    let target = ((q * m as f64).ceil() as usize).clamp(1, m);
    let bound = (max_error * m as f64) as usize + 1;
    assert!(
        rank.abs_diff(target) <= bound,
        "q={} estimate={} rank={} target={} bound={}",
        q,
        value,
        rank,
        target,
        bound
    );
}

#[test]
fn test_percentiles_within_error_bound() {
    const N: i64 = 60_000;
    let max_error = QuantileDigest::DEFAULT_MAX_ERROR;

    let schema = SegmentSchema::new()
        .with_dimension("bucket", DimensionType::Long)
        .with_dimension("shard", DimensionType::Long)
        .with_metric("v", DataType::Int64);
    // A permutation of 0..N spread over many leaves
    let rows: Vec<RawRow> = (0..N)
        .map(|i| {
            RawRow::new(
                vec![DimensionValue::Long(i % 13), DimensionValue::Long(i % 7)],
                vec![MetricValue::Int64((i * 7919) % N)],
            )
        })
        .collect();
    let dictionaries = SegmentDictionaries::build(&schema, &rows).expect("dictionaries");
    let config = StarTreeIndexConfig::new(&["bucket", "shard"], &["PERCENTILEEST__v"])
        .with_max_leaf_records(0)
        .resolve(&schema)
        .expect("config");
    let tree = StarTreeBuilder::new(&config)
        .build(&dictionaries.encode_rows(&rows).expect("encode"))
        .expect("build");

    // The root digest went through compression while children were merged
    match &tree.root_record().expect("root").states()[0] {
        AggregatorState::PercentileEst(digest) => {
            assert_eq!(digest.count(), N as u64);
            assert!(digest.node_count() < N as usize / 2, "{} nodes", digest.node_count());
        }
        other => panic!("unexpected state {:?}", other),
    }

    let all: Vec<i64> = (0..N).collect();
    let mut subset: Vec<i64> = rows
        .iter()
        .filter(|row| matches!(row.dimensions[0], DimensionValue::Long(b) if b < 4))
        .map(|row| match row.metrics[0] {
            MetricValue::Int64(v) => v,
            other => panic!("unexpected metric {:?}", other),
        })
        .collect();
    subset.sort_unstable();

    for step in 0..=100 {
        let q = step as f64 / 100.0;

        // Answered from the stored root record
        let whole = StarTreeQuery::new().percentile(AggregationType::PercentileEst, "v", q);
        assert_rank_within(&all, percentile_of(&tree, &dictionaries, whole), q, max_error);

        // Merged at query time from four bucket nodes
        let filtered = StarTreeQuery::new()
            .filter_in("bucket", [0i64, 1, 2, 3])
            .percentile(AggregationType::PercentileEst, "v", q);
        assert_rank_within(&subset, percentile_of(&tree, &dictionaries, filtered), q, max_error);
    }
}
