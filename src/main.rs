use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_beacon::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries host replies; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli::execute(cli).await
}
