//! Router registry endpoints, membership client and proxying to a live worker.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tower::ServiceExt;

use keel_api::config::Config;
use keel_api::membership::{Heartbeat, Registration, RouterClient};
use keel_api::router::{RouterHealth, RouterServer, WorkerInfo, WorkerRegistry, WorkersResponse};
use keel_api::routes::workspaces::IngestResponse;
use keel_api::server::Server;
use keel_core::ManualClock;
use keel_engine::workspace::StatusReport;
use keel_test_utils::{EventFactory, init_test_logging};

const PARTITIONS: u32 = 4;

fn router_with_clock() -> (Router, Arc<WorkerRegistry>, Arc<ManualClock>) {
    init_test_logging();
    let clock = Arc::new(ManualClock::at_millis(0));
    let workers = Arc::new(WorkerRegistry::with_clock(
        PARTITIONS,
        Duration::from_secs(30),
        clock.clone(),
    ));
    let mut config = Config::default();
    config.partition_count = PARTITIONS;
    let router = RouterServer::with_registry(config, Arc::clone(&workers)).test_router();
    (router, workers, clock)
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Result<(StatusCode, Bytes)> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value)?)
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).context("build request")?)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .context("read response body")?;
    Ok((status, body))
}

fn json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).context("parse JSON body")
}

/// Serves `router` on an ephemeral loopback port and returns its base URL.
async fn spawn_http(router: Router) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn registration_heartbeat_and_eviction() -> Result<()> {
    let (router, _workers, clock) = router_with_clock();

    let registration = serde_json::json!({
        "workerId": "w1",
        "httpAddress": "http://w1:8080",
        "partitions": [0, 1, 2, 3],
    });
    let (status, body) = send(&router, Method::POST, "/register", Some(registration)).await?;
    assert_eq!(status, StatusCode::OK);
    let info: WorkerInfo = json(&body)?;
    assert_eq!(info.partitions, vec![0, 1, 2, 3]);

    let (_, body) = send(&router, Method::GET, "/healthz", None).await?;
    let health: RouterHealth = json(&body)?;
    assert_eq!(health.status, "ok");
    assert_eq!(health.workers, 1);

    clock.advance(chrono::Duration::seconds(20));
    let beat = serde_json::json!({"workerId": "w1"});
    let (status, _) = send(&router, Method::POST, "/heartbeat", Some(beat.clone())).await?;
    assert_eq!(status, StatusCode::OK);

    clock.advance(chrono::Duration::seconds(31));
    let (_, body) = send(&router, Method::GET, "/workers", None).await?;
    let workers: WorkersResponse = json(&body)?;
    assert!(workers.workers.is_empty());

    let (status, _) = send(&router, Method::POST, "/heartbeat", Some(beat)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = send(&router, Method::GET, "/healthz", None).await?;
    let health: RouterHealth = json(&body)?;
    assert_eq!(health.status, "degraded");
    assert_eq!(health.uncovered_partitions, vec![0, 1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn out_of_range_partitions_are_rejected() -> Result<()> {
    let (router, _, _) = router_with_clock();
    let registration = serde_json::json!({
        "workerId": "w1",
        "httpAddress": "http://w1:8080",
        "partitions": [PARTITIONS],
    });
    let (status, _) = send(&router, Method::POST, "/register", Some(registration)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn workspace_requests_without_a_worker_are_unavailable() -> Result<()> {
    let (router, _, _) = router_with_clock();
    let (status, _) = send(&router, Method::GET, "/v1/workspaces/acme/status", None).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

#[tokio::test]
async fn workspace_requests_are_proxied_to_the_owner() -> Result<()> {
    init_test_logging();
    let mut worker_config = Config::default();
    worker_config.partition_count = PARTITIONS;
    worker_config.worker_id = "w1".into();
    let worker_url = spawn_http(Server::new(worker_config).test_router()).await?;

    let mut router_config = Config::default();
    router_config.partition_count = PARTITIONS;
    let router = RouterServer::new(router_config);
    router.workers().register(Registration {
        worker_id: "w1".into(),
        http_address: worker_url,
        partitions: (0..PARTITIONS).collect(),
    })?;
    let router = router.test_router();

    let mut events = EventFactory::new("acme");
    let batch = serde_json::to_value(vec![events.system("sys1"), events.tick()])?;
    let (status, body) = send(&router, Method::POST, "/v1/workspaces/acme/events", Some(batch)).await?;
    assert_eq!(status, StatusCode::OK);
    let ingested: IngestResponse = json(&body)?;
    assert_eq!(ingested.results.len(), 2);

    let (status, body) = send(&router, Method::GET, "/v1/workspaces/acme/status", None).await?;
    assert_eq!(status, StatusCode::OK);
    let report: StatusReport = json(&body)?;
    assert_eq!(report.workspace_id, "acme");
    assert_eq!(report.events_applied, 2);

    // Worker errors pass through unchanged.
    let (status, _) = send(&router, Method::GET, "/v1/workspaces/globex/status", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn membership_client_round_trip() -> Result<()> {
    let (router, workers, _) = router_with_clock();
    let url = spawn_http(router).await?;
    let client = RouterClient::new(url);

    assert_eq!(client.heartbeat("w9").await?, Heartbeat::Unknown);
    client
        .register(&Registration {
            worker_id: "w9".into(),
            http_address: "http://w9:8080".into(),
            partitions: vec![1],
        })
        .await?;
    assert_eq!(client.heartbeat("w9").await?, Heartbeat::Acknowledged);
    assert_eq!(workers.worker_for_partition(1)?.map(|w| w.worker_id), Some("w9".into()));

    client.unregister("w9").await?;
    assert!(workers.workers()?.is_empty());
    Ok(())
}
