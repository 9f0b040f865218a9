//! claimstack CLI: deploy and operate the insurance claim pipeline.
//!
//! Provisions the stack step by step, bootstraps the vector index, runs
//! knowledge base ingestion, reports deployment health, and runs the claim
//! analysis pipeline against local files or stored documents.

mod commands;
mod progress;

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
