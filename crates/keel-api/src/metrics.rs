//! Prometheus export and HTTP request metrics for workers and routers.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `keel_http_request_duration_seconds` | Histogram | `route`, `method`, `class` |
//! | `keel_http_requests_total` | Counter | `route`, `method`, `class` |
//! | `keel_router_proxy_total` | Counter | `outcome` |
//! | `keel_router_workers` | Gauge | - |
//! | `keel_router_evictions_total` | Counter | - |
//! | `keel_ticks_total` | Counter | `result` |
//!
//! Engine metrics (`keel_events_applied_total` and friends) are described
//! here too so one scrape documents the whole process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use keel_engine::metrics::names as engine;

/// Metric names recorded by the HTTP layer.
pub mod names {
    /// Request latency by route pattern.
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "keel_http_request_duration_seconds";
    /// Requests by route pattern.
    pub const HTTP_REQUESTS_TOTAL: &str = "keel_http_requests_total";
    /// Router proxy outcomes.
    pub const ROUTER_PROXY_TOTAL: &str = "keel_router_proxy_total";
    /// Live workers known to the router.
    pub const ROUTER_WORKERS: &str = "keel_router_workers";
    /// Workers evicted for missing heartbeats.
    pub const ROUTER_EVICTIONS_TOTAL: &str = "keel_router_evictions_total";
    /// Periodic ticks delivered to workspaces.
    pub const TICKS_TOTAL: &str = "keel_ticks_total";
}

/// Route label for requests no route matched.
const NO_ROUTE: &str = "none";

/// Requests slower than this are logged.
const SLOW_REQUEST: Duration = Duration::from_secs(1);

const TEXT_PLAIN: &str = "text/plain; version=0.0.4; charset=utf-8";

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder once per process and returns its handle.
///
/// # Panics
///
/// Panics if another global recorder is already installed. A process that
/// cannot export metrics should not start.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("cannot install prometheus recorder: {e}"));
            describe_all();
            tracing::info!("prometheus recorder installed");
            handle
        })
        .clone()
}

fn describe_all() {
    describe_histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(names::HTTP_REQUESTS_TOTAL, "HTTP requests served");
    describe_counter!(names::ROUTER_PROXY_TOTAL, "Requests proxied by the router");
    describe_gauge!(names::ROUTER_WORKERS, "Live workers known to the router");
    describe_counter!(names::ROUTER_EVICTIONS_TOTAL, "Workers evicted for missing heartbeats");
    describe_counter!(names::TICKS_TOTAL, "Periodic ticks delivered to workspaces");

    describe_counter!(engine::EVENTS_APPLIED_TOTAL, "Events applied by outcome");
    describe_histogram!(engine::APPLY_DURATION_SECONDS, "Event apply duration in seconds");
    describe_counter!(engine::RELEASE_TARGETS_CHANGED_TOTAL, "Release targets added or removed");
    describe_counter!(engine::POLICY_DECISIONS_TOTAL, "Policy decisions by outcome");
    describe_counter!(engine::JOBS_CREATED_TOTAL, "Jobs created by status");
    describe_counter!(engine::WORKQUEUE_OPERATIONS_TOTAL, "Workqueue operations by result");
    describe_counter!(engine::DISPATCHES_TOTAL, "Job dispatches by outcome");
    describe_gauge!(engine::WORKSPACES_LOADED, "Workspaces loaded in memory");
}

/// Route pattern of a request, e.g. `/v1/workspaces/:workspace_id/status`.
///
/// Concrete paths would put workspace ids into label values.
fn route_label<B>(request: &Request<B>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or(NO_ROUTE, MatchedPath::as_str)
        .to_string()
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "other",
    }
}

/// Records latency and count of every request.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let route = route_label(&request);
    let method = request.method().as_str().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status();
    let labels = [
        ("route", route),
        ("method", method),
        ("class", status_class(status).to_owned()),
    ];
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);

    if elapsed >= SLOW_REQUEST {
        let [(_, route), (_, method), _] = &labels;
        tracing::warn!(
            route = %route,
            method = %method,
            status = status.as_u16(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "slow request"
        );
    }
    response
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn serve_metrics() -> Response {
    match RECORDER.get() {
        Some(handle) => ([(header::CONTENT_TYPE, TEXT_PLAIN)], handle.render()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// Records a proxied request outcome.
pub fn record_proxy(outcome: &'static str) {
    counter!(names::ROUTER_PROXY_TOTAL, "outcome" => outcome).increment(1);
}

/// Records the number of live workers.
#[allow(clippy::cast_precision_loss)]
pub fn set_router_workers(count: usize) {
    gauge!(names::ROUTER_WORKERS).set(count as f64);
}

/// Records evicted workers.
pub fn record_evictions(count: usize) {
    counter!(names::ROUTER_EVICTIONS_TOTAL).increment(count as u64);
}

/// Records a delivered tick.
pub fn record_tick(result: &'static str) {
    counter!(names::TICKS_TOTAL, "result" => result).increment(1);
}
