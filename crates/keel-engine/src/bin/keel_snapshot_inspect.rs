//! Decodes a binary workspace snapshot and pretty-prints it as JSON.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use keel_engine::persistence::Snapshot;

#[derive(Debug, Parser)]
#[command(name = "keel_snapshot_inspect", about = "Pretty-print a keel workspace snapshot")]
struct Args {
    /// Snapshot file to decode.
    path: PathBuf,

    /// Only print the header (workspace, sequence, repository sizes).
    #[arg(long)]
    summary: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let bytes = std::fs::read(&args.path)
        .with_context(|| format!("read snapshot {}", args.path.display()))?;
    let snapshot = Snapshot::decode(&bytes).context("decode snapshot")?;

    let rendered = if args.summary {
        let repositories: serde_json::Map<String, serde_json::Value> = snapshot
            .repositories
            .iter()
            .map(|(name, body)| {
                let count = serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(body)
                    .map(|m| m.len())
                    .unwrap_or_default();
                (name.clone(), serde_json::Value::from(count))
            })
            .collect();
        serde_json::to_string_pretty(&serde_json::json!({
            "workspaceId": snapshot.workspace_id,
            "sequence": snapshot.sequence,
            "repositories": repositories,
        }))?
    } else {
        serde_json::to_string_pretty(&snapshot.to_json()?)?
    };

    let mut out = io::stdout().lock();
    out.write_all(rendered.as_bytes()).context("write to stdout")?;
    out.write_all(b"\n").context("write to stdout")?;
    Ok(())
}
