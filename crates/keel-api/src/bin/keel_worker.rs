//! `keel_worker` entrypoint.
//!
//! Loads configuration from environment variables and serves the owned
//! workspace partitions until SIGINT or SIGTERM.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use keel_api::config::Config;
use keel_api::server::Server;
use keel_core::observability::{LogFormat, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(LogFormat::for_debug(config.debug));

    if config.router_url.is_none() {
        tracing::warn!("KEEL_ROUTER_URL not set; serving without router membership");
    }

    Server::new(config).serve().await?;
    Ok(())
}
