//! Worker membership with the router.
//!
//! A worker registers its address and partitions, then heartbeats on a
//! fixed period. A heartbeat the router does not recognise (the worker was
//! evicted, or the router restarted) triggers a fresh registration.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use keel_core::{Error, Result};

/// Body of `POST /register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Worker identity.
    pub worker_id: String,
    /// Base URL the router proxies to.
    pub http_address: String,
    /// Owned partitions.
    pub partitions: Vec<u32>,
}

/// Body of `POST /heartbeat` and `POST /unregister`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRef {
    /// Worker identity.
    pub worker_id: String,
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// The router knows this worker.
    Acknowledged,
    /// The router has no record of this worker.
    Unknown,
}

/// HTTP client for the router's registry endpoints.
#[derive(Debug, Clone)]
pub struct RouterClient {
    client: reqwest::Client,
    base_url: String,
}

impl RouterClient {
    /// Client for the router at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Registers or re-registers the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the router is unreachable or rejects the request.
    pub async fn register(&self, registration: &Registration) -> Result<()> {
        let status = self.post("register", registration).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::internal(format!("router rejected registration: {status}")))
        }
    }

    /// Sends one heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the router is unreachable or fails.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<Heartbeat> {
        let body = WorkerRef {
            worker_id: worker_id.to_string(),
        };
        let status = self.post("heartbeat", &body).await?;
        match status {
            s if s.is_success() => Ok(Heartbeat::Acknowledged),
            StatusCode::NOT_FOUND => Ok(Heartbeat::Unknown),
            s => Err(Error::internal(format!("router rejected heartbeat: {s}"))),
        }
    }

    /// Removes the worker from the router.
    ///
    /// # Errors
    ///
    /// Returns an error if the router is unreachable.
    pub async fn unregister(&self, worker_id: &str) -> Result<()> {
        let body = WorkerRef {
            worker_id: worker_id.to_string(),
        };
        self.post("unregister", &body).await.map(|_| ())
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<StatusCode> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::internal(format!("POST {url} failed: {e}")))?;
        Ok(response.status())
    }
}

/// Registers, then heartbeats every `interval` until the task is aborted.
pub async fn run(client: RouterClient, registration: Registration, interval: Duration) {
    let mut registered = false;
    loop {
        if registered {
            match client.heartbeat(&registration.worker_id).await {
                Ok(Heartbeat::Acknowledged) => {}
                Ok(Heartbeat::Unknown) => {
                    tracing::warn!(worker_id = %registration.worker_id, "router lost this worker; re-registering");
                    registered = false;
                }
                Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
            }
        }
        if !registered {
            match client.register(&registration).await {
                Ok(()) => {
                    tracing::info!(
                        worker_id = %registration.worker_id,
                        http_address = %registration.http_address,
                        partitions = ?registration.partitions,
                        "registered with router"
                    );
                    registered = true;
                }
                Err(e) => tracing::warn!(error = %e, "registration failed"),
            }
        }
        tokio::time::sleep(interval).await;
    }
}
