use anyhow::Result;
use clap::Parser;

use meta_agent::app;
use meta_agent::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    app::run(cli).await
}
