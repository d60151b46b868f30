//! `keel_router` entrypoint.
//!
//! Keeps the worker registry and proxies workspace requests to the worker
//! owning each workspace's partition.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use keel_api::config::Config;
use keel_api::router::RouterServer;
use keel_core::observability::{LogFormat, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(LogFormat::for_debug(config.debug));

    RouterServer::new(config).serve().await?;
    Ok(())
}
