use anyhow::Result;
use clap::Parser;

mod cli;
mod format;

use ariadne::telemetry;

fn main() -> Result<()> {
    let _telemetry = telemetry::init();
    let cli = cli::Cli::parse();
    cli::run(cli)
}
