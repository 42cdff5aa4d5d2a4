//! SourceHub CLI: run and query pluggable source provider instances.
//!
//! Loads instances from the config file, then fans `search` and `schedule`
//! out to every capable instance and prints the merged results.

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
