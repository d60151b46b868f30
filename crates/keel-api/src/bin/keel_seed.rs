//! `keel_seed`: posts NDJSON events to a worker or router.
//!
//! Reads `BOOTSTRAP_SERVER` and `WORKSPACE_ID` from the environment; flags
//! override both.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Parser;

use keel_api::config::Config;
use keel_api::routes::workspaces::IngestResponse;
use keel_api::seed::{batches, parse_events};
use keel_core::observability::{LogFormat, init_logging};
use keel_core::{Clock, SystemClock};

#[derive(Debug, Parser)]
#[command(name = "keel_seed", about = "Post NDJSON events to a keel workspace")]
struct Args {
    /// NDJSON file of events.
    path: PathBuf,

    /// Base URL of a worker or router; defaults to `BOOTSTRAP_SERVER`.
    #[arg(long)]
    server: Option<String>,

    /// Workspace for events without one; defaults to `WORKSPACE_ID`.
    #[arg(long)]
    workspace_id: Option<String>,

    /// Events per request.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_logging(LogFormat::for_debug(config.debug));

    let Some(server) = args.server.or(config.bootstrap_server) else {
        bail!("BOOTSTRAP_SERVER is required (or pass --server)");
    };
    let server = server.trim_end_matches('/').to_string();
    let workspace_id = args.workspace_id.or(config.workspace_id);

    let input = std::fs::read_to_string(&args.path)
        .with_context(|| format!("read {}", args.path.display()))?;
    let events = parse_events(&input, workspace_id.as_deref(), SystemClock.now_millis())?;
    let total = events.len();

    let client = reqwest::Client::new();
    for (workspace_id, batch) in batches(events, args.batch_size) {
        let url = format!("{server}/v1/workspaces/{workspace_id}/events");
        let response = client
            .post(&url)
            .json(&batch)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("POST {url} failed with {status}: {body}");
        }
        let ingested: IngestResponse = response.json().await.context("decode ingest response")?;
        tracing::info!(
            workspace_id = %ingested.workspace_id,
            events = ingested.results.len(),
            sequence = ingested.sequence,
            "batch applied"
        );
    }

    tracing::info!(events = total, "seeding complete");
    Ok(())
}
