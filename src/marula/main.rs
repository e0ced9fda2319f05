// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Marula pulls freshly uploaded rider traces from the contributor feed and
// runs each one through the consensus pipeline: stop inference, geometry,
// matching against pending candidates, and promotion bookkeeping. One
// invocation processes one batch; schedule it as often as the feed warrants.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use acacia::consensus::{ConsensusConfig, RunStats, process_trace};
use acacia::feed::FeedClient;
use acacia::postgres_tools::make_async_pool;
use acacia::store::postgres::PgConsensusStore;
use anyhow::{Context, anyhow};
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Pull traces recorded within this many hours.
    #[arg(long, default_value_t = 24)]
    since_hours: i64,

    /// Concurrent trace units in flight.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Verification count required for promotion.
    #[arg(long)]
    promotion_threshold: Option<i32>,

    /// Curve-distance match ceiling in metres.
    #[arg(long)]
    match_threshold: Option<f64>,

    /// Spatial prefilter radius in metres.
    #[arg(long)]
    match_radius: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ConsensusConfig::default();
    if let Some(threshold) = args.promotion_threshold {
        config.promotion_threshold = threshold;
    }
    if let Some(threshold) = args.match_threshold {
        config.match_threshold_m = threshold;
    }
    if let Some(radius) = args.match_radius {
        config.match_radius_m = radius;
    }

    let feed = FeedClient::from_env().context("contributor feed configuration")?;

    let pool = make_async_pool()
        .await
        .map_err(|e| anyhow!("building postgres pool: {e}"))?;
    let store = PgConsensusStore::new(Arc::new(pool));

    let since = Utc::now() - chrono::Duration::hours(args.since_hours);
    let traces = feed
        .fetch_since(since)
        .await
        .context("fetching contributor feed")?;

    info!("processing {} traces since {}", traces.len(), since);

    // Every trace is an independent unit; interleaving between units is
    // safe because all shared state lives behind the store's conditional
    // updates.
    let outcomes = futures::stream::iter(traces.into_iter().enumerate().map(
        |(index, trace)| {
            let store = &store;
            let config = &config;
            async move {
                let device = trace.device_id.clone();
                let result = process_trace(store, config, trace, Utc::now()).await;
                (index, device, result)
            }
        },
    ))
    .buffer_unordered(args.workers.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut stats = RunStats::default();
    for (index, device, result) in outcomes {
        match result {
            Ok(outcome) => stats.absorb(&outcome),
            Err(e) => {
                warn!(trace = index, device = %device, "trace unit failed: {e}");
                stats.note_unit_error();
            }
        }
    }

    info!("ingest batch complete: {stats}");

    Ok(())
}
