//! Stateless release-target computation.
//!
//! `POST /v1/release-targets/compute` derives the targets of the posted
//! entities without touching any workspace and streams them as NDJSON, one
//! target per line, as soon as each is found. Line order is unspecified.
//! A failure after the stream has started is reported as a final
//! `{"error": {...}}` line.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream;
use tokio::sync::{mpsc, oneshot};

use keel_core::parallel::CancelFlag;
use keel_engine::error::{Error, Result};
use keel_engine::model::ReleaseTarget;
use keel_engine::release_target::{ComputeScope, TargetInputs, stream_release_targets};

use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

/// NDJSON content type.
pub const NDJSON: &str = "application/x-ndjson";

const CHANNEL_CAPACITY: usize = 256;

/// Creates release-target routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/v1/release-targets/compute", post(compute))
}

/// Stream release targets.
///
/// POST /v1/release-targets/compute
async fn compute(State(state): State<Arc<AppState>>, Json(inputs): Json<TargetInputs>) -> Response {
    let (tx, rx) = mpsc::channel::<ReleaseTarget>(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel::<Result<()>>();
    let options = state.chunk_options;

    tracing::debug!(
        environments = inputs.environments.len(),
        deployments = inputs.deployments.len(),
        resources = inputs.resources.len(),
        "computing release targets"
    );
    tokio::spawn(async move {
        let result =
            stream_release_targets(&inputs, &ComputeScope::Full, options, CancelFlag::new(), tx)
                .await;
        // The receiver is gone when the client disconnected.
        let _ = done_tx.send(result);
    });

    let body = Body::from_stream(ndjson_lines(rx, done_rx));
    ([(header::CONTENT_TYPE, NDJSON)], body).into_response()
}

enum Phase {
    Targets(mpsc::Receiver<ReleaseTarget>, oneshot::Receiver<Result<()>>),
    Done,
}

fn ndjson_lines(
    rx: mpsc::Receiver<ReleaseTarget>,
    done: oneshot::Receiver<Result<()>>,
) -> impl futures::Stream<Item = std::result::Result<Bytes, Infallible>> {
    stream::unfold(Phase::Targets(rx, done), |phase| async move {
        let Phase::Targets(mut rx, done) = phase else {
            return None;
        };
        if let Some(target) = rx.recv().await {
            return Some((Ok(line(&target)), Phase::Targets(rx, done)));
        }
        match done.await {
            Ok(Ok(()) | Err(Error::Cancelled)) => None,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "release-target stream failed");
                Some((Ok(error_line(e)), Phase::Done))
            }
            Err(_) => Some((
                Ok(error_line(Error::internal("release-target task ended unexpectedly"))),
                Phase::Done,
            )),
        }
    })
}

fn line(target: &ReleaseTarget) -> Bytes {
    match serde_json::to_vec(target) {
        Ok(mut bytes) => {
            bytes.push(b'\n');
            Bytes::from(bytes)
        }
        Err(e) => error_line(Error::from(e)),
    }
}

fn error_line(error: Error) -> Bytes {
    let api = ApiError::from(error);
    let body = serde_json::json!({
        "error": ApiErrorBody {
            code: api.code().to_string(),
            message: api.message().to_string(),
        }
    });
    let mut bytes = body.to_string().into_bytes();
    bytes.push(b'\n');
    Bytes::from(bytes)
}
