//! GeoHarvest CLI: harvest geospatial metadata into a local record store.
//!
//! Registers CSW, WAF and single-document sources and runs gather, fetch
//! and import jobs against them.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
