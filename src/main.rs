mod cli;
mod engine;
mod error;
mod ingest;
mod model;
mod orchestrator;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr next to operator prompts; RUST_LOG=info shows lifecycle logs.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();

    cli::run(args).await?;
    // The operator input thread may still be parked on a stdin read.
    std::process::exit(0)
}
