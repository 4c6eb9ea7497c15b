//! Star-tree inspection tool
//!
//! Reads persisted star-tree files and index configurations without a
//! running segment.
//!
//! # Example Usage
//!
//! ```bash
//! # Header, metadata, statistics and root aggregates
//! startree-tool inspect segment.stree
//!
//! # First 20 nodes of the arena
//! startree-tool nodes segment.stree --limit 20
//!
//! # Decode every node and record
//! startree-tool verify segment.stree
//!
//! # Validate an index configuration (env overrides applied)
//! startree-tool check-config startree.toml
//!
//! # Take the log level from an index configuration
//! startree-tool --config startree.toml verify segment.stree
//! ```
//!
//! Logging follows `logging.level` of the `--config` file, or `RUST_LOG`
//! when no file is given.

use clap::{Parser, Subcommand};
use kuba_startree::config::{LoggingSection, StarTreeIndexConfig};
use kuba_startree::startree::{self, NodeId, StarTreeReader, StarTreeSource};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "startree-tool")]
#[command(about = "Inspect and verify star-tree index files")]
#[command(version)]
struct Cli {
    /// Index configuration supplying `logging.level`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header, metadata, statistics and root aggregates
    Inspect {
        /// Persisted tree file
        file: PathBuf,
    },
    /// Dump nodes in arena order
    Nodes {
        /// Persisted tree file
        file: PathBuf,

        /// Maximum number of nodes to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Decode every node and check each record against its children
    Verify {
        /// Persisted tree file
        file: PathBuf,
    },
    /// Load and validate an index configuration
    CheckConfig {
        /// TOML configuration file
        file: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let logging = match &cli.config {
        Some(path) => StarTreeIndexConfig::from_file_with_env(path)?.logging,
        None => StarTreeIndexConfig::from_env().logging,
    };
    init_logging(&logging)?;

    match cli.command {
        Commands::Inspect { file } => inspect(&file),
        Commands::Nodes { file, limit } => nodes(&file, limit),
        Commands::Verify { file } => verify(&file),
        Commands::CheckConfig { file } => check_config(&file),
    }
}

fn init_logging(logging: &LoggingSection) -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_new(logging.filter_directives())?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn inspect(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader = StarTreeReader::open(file)?;
    let header = reader.header();
    let metadata = reader.metadata();
    let stats = reader.stats();

    println!("File:            {}", file.display());
    println!("Size:            {} bytes", reader.size_bytes());
    println!("Format version:  {}", header.version);
    println!("Split order:     {}", metadata.split_order.join(" → "));
    if !metadata.skip_star_node_creation.is_empty() {
        println!(
            "Skip star:       {}",
            metadata.skip_star_node_creation.join(", ")
        );
    }
    println!("Star threshold:  {}", metadata.star_threshold);
    println!("Max leaf records:{:>6}", metadata.max_leaf_records);
    println!();
    println!("Raw rows:        {}", stats.raw_rows);
    println!("Records:         {}", stats.records);
    println!(
        "Nodes:           {} ({} leaves, {} star)",
        stats.nodes, stats.leaves, stats.star_nodes
    );
    println!("Leaf records:    {}", stats.leaf_records);
    println!("Max depth:       {}", stats.max_depth);
    println!();

    let root = reader.node_record(NodeId::ROOT)?;
    println!("Root aggregates:");
    for (aggregator, state) in metadata.aggregators.iter().zip(root.states()) {
        println!(
            "  {:<32} {}",
            aggregator.pair().to_string(),
            aggregator.extract(state, None)
        );
    }
    Ok(())
}

fn nodes(file: &Path, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let reader = StarTreeReader::open(file)?;
    let split_order = &reader.metadata().split_order;

    println!(
        "{:>8} {:>5} {:<16} {:>10} {:>14} {:>14}",
        "node", "depth", "split", "id", "children", "leaf records"
    );
    for i in 0..reader.node_count().min(limit) {
        let node = reader.node(NodeId(i as u32))?;
        let split = node
            .split_level
            .and_then(|level| split_order.get(level as usize))
            .map_or("-", String::as_str);
        println!(
            "{:>8} {:>5} {:<16} {:>10} {:>14} {:>14}",
            NodeId(i as u32).to_string(),
            node.depth,
            split,
            node.dimension_id.to_string(),
            format!("{:?}", node.children),
            format!("{:?}", node.leaf_records),
        );
    }
    if reader.node_count() > limit {
        println!("... {} more", reader.node_count() - limit);
    }
    Ok(())
}

fn verify(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader = StarTreeReader::open(file)?;
    let report = startree::verify(&reader)?;
    info!(
        nodes = report.nodes,
        merged_nodes = report.merged_nodes,
        leaf_records = report.leaf_records,
        "Verified star-tree"
    );
    println!(
        "OK: {} nodes ({} recomputed from children), {} leaf records",
        report.nodes, report.merged_nodes, report.leaf_records
    );
    Ok(())
}

fn check_config(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = StarTreeIndexConfig::from_file_with_env(file)?;
    config.validate()?;
    println!("OK: {}", file.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
