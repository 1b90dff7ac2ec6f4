//! quire CLI: incremental document builds with a live preview.
//!
//! Compiles a project of Markdown notebooks into linked HTML pages, running
//! code cells alongside compilation and rebuilding only what changed.

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
