//! Gleaner CLI: scheduled document ingestion, normalization and evaluation.
//!
//! Crawls configured sources politely, stores each distinct document once,
//! extracts text and metadata, and scores documents against versioned rubrics.

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
