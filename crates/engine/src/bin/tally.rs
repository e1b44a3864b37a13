// crates/engine/src/bin/tally.rs
//! Demo runner: load a config and a counter catalog, ingest message files,
//! print the counter responses.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use tally_core::config::EngineConfig;
use tally_core::fact::{Fact, IndexEntry};
use tally_engine::{metrics, ComputeOptions, Engine};

#[derive(Parser)]
#[command(name = "tally", about = "Fact ingestion and counter evaluation engine")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, default_value = "tally.toml")]
    config: PathBuf,

    /// Message files to ingest: `{"fact": {...}, "indexEntries": [...]}`.
    messages: Vec<PathBuf>,

    /// Print the Prometheus metrics dump after ingesting.
    #[arg(long)]
    dump_metrics: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    fact: Fact,
    #[serde(default)]
    index_entries: Vec<IndexEntry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    metrics::init_metrics();

    let args = Args::parse();
    let config = EngineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let engine = Engine::new(config).await?;

    let opts = ComputeOptions::default();
    for path in &args.messages {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let message: Message =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let outcome = engine
            .ingest_message(&message.fact, &message.index_entries, &opts)
            .await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }

    if args.dump_metrics {
        if let Some(dump) = metrics::render_metrics() {
            println!("{dump}");
        }
    }
    engine.shutdown().await;
    Ok(())
}
