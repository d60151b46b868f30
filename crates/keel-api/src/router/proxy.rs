//! Reverse proxy for workspace requests.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::Response;

use crate::error::{ApiError, ApiResult};
use crate::metrics::record_proxy;
use crate::partition::{partition_for, workspace_id_from_path};
use crate::router::RouterState;

/// Largest request body forwarded to a worker.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

/// Forwards `/v1/workspaces/{id}/...` to the worker owning the workspace.
pub async fn proxy(State(state): State<Arc<RouterState>>, request: Request) -> ApiResult<Response> {
    let workspace_id = workspace_id_from_path(request.uri().path())
        .ok_or_else(|| ApiError::bad_request("path does not name a workspace"))?
        .to_string();
    let partition = partition_for(&workspace_id, state.workers.partition_count());
    let Some(worker) = state.workers.worker_for_partition(partition)? else {
        record_proxy("no_worker");
        return Err(ApiError::unavailable(format!(
            "no live worker owns partition {partition}"
        )));
    };

    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), ToString::to_string);
    let url = format!("{}{path_and_query}", worker.http_address);
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::bad_request(format!("unreadable request body: {e}")))?;

    tracing::debug!(
        workspace_id = %workspace_id,
        partition,
        worker_id = %worker.worker_id,
        method = %parts.method,
        "proxying request"
    );
    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(forwardable(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            record_proxy("upstream_error");
            ApiError::bad_gateway(format!("worker {} unreachable: {e}", worker.worker_id))
        })?;

    let status = upstream.status();
    let headers = forwardable(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| {
        record_proxy("upstream_error");
        ApiError::bad_gateway(format!("worker {} response failed: {e}", worker.worker_id))
    })?;
    record_proxy("forwarded");

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
