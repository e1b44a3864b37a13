// crates/pool/src/bin/query_worker.rs
//! Subordinate query process. Frames on stdin/stdout, logs on stderr.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries protocol frames; everything human-readable must go to
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    tally_pool::worker::run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
