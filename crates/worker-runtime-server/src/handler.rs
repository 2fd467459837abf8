//! Request handlers for worker dispatch.
//!
//! Every request that does not hit a reserved route is forwarded to the
//! worker pool through [`handle_request`].

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use worker_runtime_common::{PoolError, PoolStatus, RuntimeError, WorkerError};
use worker_runtime_core::EntryPoint;

use crate::request::{MAX_BODY_BYTES, from_axum};
use crate::response::{error_response, into_axum_response};
use crate::state::AppState;

/// Dispatch an HTTP request to the next worker.
///
/// This handler:
/// 1. Buffers the request body (up to [`MAX_BODY_BYTES`])
/// 2. Converts the request to the transport-neutral record
/// 3. Dispatches it round-robin through the runtime
/// 4. Converts the worker's response, or maps its error to a status
#[instrument(skip_all, fields(method = %req.method(), uri = %req.uri()))]
pub async fn handle_request<E: EntryPoint>(
    State(state): State<AppState<E>>,
    req: Request,
) -> axum::response::Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4();

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Failed to read request body");
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    };
    let request = from_axum(&axum::http::Request::from_parts(parts, ()), body);

    match state.runtime().dispatch(request).await {
        Ok(response) => {
            debug!(
                request_id = %request_id,
                status = response.status,
                duration_ms = start.elapsed().as_millis(),
                "Request completed"
            );
            into_axum_response(response)
        }
        Err(e) => {
            warn!(
                request_id = %request_id,
                error = %e,
                duration_ms = start.elapsed().as_millis(),
                "Request failed"
            );
            error_to_response(&e)
        }
    }
}

/// HTTP status for a runtime error.
pub fn error_status(error: &RuntimeError) -> StatusCode {
    match error {
        RuntimeError::Pool(PoolError::Busy | PoolError::NoAvailableWorker | PoolError::NotRunning)
        | RuntimeError::Worker(
            WorkerError::Busy { .. }
            | WorkerError::NotRunning { .. }
            | WorkerError::Unavailable { .. }
            | WorkerError::Start { .. },
        ) => StatusCode::SERVICE_UNAVAILABLE,
        RuntimeError::Worker(WorkerError::Crashed { .. }) => StatusCode::BAD_GATEWAY,
        RuntimeError::Worker(WorkerError::Aborted { .. }) => StatusCode::GATEWAY_TIMEOUT,
        RuntimeError::Pool(PoolError::AlreadyRunning) => StatusCode::CONFLICT,
        RuntimeError::FacilityUnavailable { .. } => StatusCode::NOT_FOUND,
        RuntimeError::PathNotFound { .. } | RuntimeError::Config { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a runtime error to an HTTP response.
pub fn error_to_response(error: &RuntimeError) -> axum::response::Response {
    error_response(error_status(error), &error.to_string())
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness check handler.
///
/// Returns 200 OK only while every worker slot is serving.
pub async fn readiness_check<E: EntryPoint>(State(state): State<AppState<E>>) -> impl IntoResponse {
    let status = state.runtime().status();
    let workers = state
        .runtime()
        .pool()
        .map_or(0, |pool| pool.workers().len());

    let body = serde_json::json!({
        "status": status,
        "workers": workers,
    });

    let code = if status == PoolStatus::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, axum::Json(body))
}
