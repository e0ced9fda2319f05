// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Tamarind is the scheduled cleanup pass: it finds pending candidates that
// describe the same physical route but were never matched during ingestion
// (out-of-order arrival, racing batches) and collapses them. Run it less
// often than marula; the two interleave safely.

use acacia::consensus::ConsensusConfig;
use acacia::merge::{MergeConfig, run_merge_pass};
use acacia::postgres_tools::make_async_pool;
use acacia::store::postgres::PgConsensusStore;
use anyhow::anyhow;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Coarse envelope prefilter radius in metres.
    #[arg(long)]
    prefilter_radius: Option<f64>,

    /// Curve-distance merge ceiling in metres.
    #[arg(long)]
    merge_threshold: Option<f64>,

    /// Verification count required for promotion.
    #[arg(long)]
    promotion_threshold: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut consensus = ConsensusConfig::default();
    if let Some(threshold) = args.promotion_threshold {
        consensus.promotion_threshold = threshold;
    }

    let mut config = MergeConfig::default();
    if let Some(radius) = args.prefilter_radius {
        config.prefilter_radius_m = radius;
    }
    if let Some(threshold) = args.merge_threshold {
        config.merge_threshold_m = threshold;
    }

    let pool = make_async_pool()
        .await
        .map_err(|e| anyhow!("building postgres pool: {e}"))?;
    let store = PgConsensusStore::new(Arc::new(pool));

    let stats = run_merge_pass(&store, &consensus, &config, Utc::now()).await?;

    info!("merge pass complete: {stats}");

    Ok(())
}
