mod bencode;
mod cli;
mod client;
mod error;
mod peer;
mod piece;
mod server;
mod storage;
mod torrent;
mod tracker;

use anyhow::Result;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the INFO default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    Cli::parse().run().await?;
    Ok(())
}
