//! epss-enrich CLI — writes EPSS exploitability scores onto active findings.
//!
//! Fetches the active findings from the tracking service, joins them against
//! the daily EPSS feed by CVE, and updates each finding with its score.

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
