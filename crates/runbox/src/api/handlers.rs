//! Execution API handlers.

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::session::PollOutcome;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Response from script submission.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    /// Unique ID of the created execution session.
    pub session_id: String,
}

/// Response while the script is still executing.
#[derive(Debug, Serialize)]
pub struct StillRunningResponse {
    pub status: &'static str,
}

/// Response once the script has terminated.
#[derive(Debug, Serialize)]
pub struct ResultResponse {
    /// Output logs from the script execution.
    pub logs: String,
    /// Failure reason when the script terminated abnormally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response from session cleanup.
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub status: &'static str,
}

/// Health/liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
    pub teardown_faults: u64,
}

/// Upload a script and start executing it in a fresh sandbox.
///
/// The call returns as soon as the container is launched; poll
/// `/result/{session_id}` for the outcome.
#[instrument(skip(state, multipart))]
pub async fn execute(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ExecuteResponse>> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart request: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(|name| name.to_string())
            .ok_or_else(|| ApiError::bad_request("No file provided"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("failed to read upload: {e}")))?;

        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let (filename, bytes) = upload.ok_or_else(|| ApiError::bad_request("No file provided"))?;

    let session_id = state.sessions.submit(&bytes, &filename).await?;
    info!(session_id = %session_id, filename = %filename, "Accepted script for execution");

    Ok(Json(ExecuteResponse { session_id }))
}

/// Fetch the outcome of a session.
///
/// 202 while the script is still executing, 200 with the captured logs once
/// it has terminated (plus the failure reason if it exited abnormally).
#[instrument(skip(state))]
pub async fn result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let response = match state.sessions.poll(&session_id).await? {
        PollOutcome::StillRunning => (
            StatusCode::ACCEPTED,
            Json(StillRunningResponse {
                status: "still running",
            }),
        )
            .into_response(),
        PollOutcome::Finished { logs } => Json(ResultResponse { logs, error: None }).into_response(),
        PollOutcome::Failed { reason, logs } => Json(ResultResponse {
            logs,
            error: Some(reason),
        })
        .into_response(),
    };

    Ok(response)
}

/// Tear down a session and its sandbox container.
#[instrument(skip(state))]
pub async fn cleanup(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<CleanupResponse>> {
    state.sessions.cleanup(&session_id).await?;
    info!(session_id = %session_id, "Cleaned up session");

    Ok(Json(CleanupResponse {
        status: "cleaned up",
    }))
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.session_count(),
        teardown_faults: state.sessions.teardown_fault_count(),
    })
}
