mod cli;
mod dispatch;
mod error;
mod model;
mod probe;
mod runner;
mod server;
mod stats;
mod target;
mod variant;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::init_tracing(&args.log_level);
    cli::run(args).await
}
