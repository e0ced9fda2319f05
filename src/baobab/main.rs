// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Baobab prints the operator-facing summary of the consensus state: status
// counts, the leading unverified candidates and the contributor leaderboard.
// Read-only; safe to run at any time.

use acacia::postgres_tools::make_async_pool;
use acacia::report::{build_report, render_text};
use acacia::store::postgres::PgConsensusStore;
use anyhow::anyhow;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// How many candidates and contributors to rank.
    #[arg(long, default_value_t = 10)]
    top: i64,

    /// Emit JSON instead of the plain-text table.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let pool = make_async_pool()
        .await
        .map_err(|e| anyhow!("building postgres pool: {e}"))?;
    let store = PgConsensusStore::new(Arc::new(pool));

    let report = build_report(&store, args.top, Utc::now()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_text(&report));
    }

    Ok(())
}
