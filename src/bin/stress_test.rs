//! Binary entry point for running the invariant-verification harness.
//! Run with: cargo run --bin stress_test

use anyhow::Result;
use prediction_market_engine::config::Config;
use prediction_market_engine::database;
use prediction_market_engine::stress::{self, StressConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info,prediction_market_engine=debug")
        .init();

    tracing::info!("prediction market engine stress test");

    let config = Config::from_env();
    let pool = database::create_pool(&config.database_url).await?;

    tracing::info!("preparing a clean schema for the stress run");
    stress::setup_test_database(&pool).await?;

    let stress_cfg = StressConfig::from_env();
    tracing::info!(?stress_cfg, "running simulation");
    let report = stress::run_stress_test(&pool, &stress_cfg).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    let all_valid = report.invariants.iter().all(|i| i.valid);
    if !all_valid {
        anyhow::bail!("one or more invariants failed; see report above");
    }

    tracing::info!("stress test completed; all invariants held");
    Ok(())
}
