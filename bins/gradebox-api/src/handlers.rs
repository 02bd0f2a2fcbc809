// HTTP route handlers for the Gradebox API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use gradebox_common::redis;
use gradebox_common::status;
use gradebox_common::types::{AssignmentRef, GradingJob, TaskRecord, TaskState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// Non-standard code telling the polling client the job is terminal and it can stop
const TERMINAL_STATUS_CODE: u16 = 286;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub submission_id: String,
    pub source_code: String,
    #[serde(default)]
    pub harness_code: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub assignment: Option<AssignmentRef>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: String,
    pub task_id: Uuid,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Reject requests the worker should never see
fn validate(request: &SubmitRequest, max_source_bytes: usize) -> Result<(), (StatusCode, String)> {
    if request.submission_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "submission_id must not be empty".to_string()));
    }
    if request.source_code.len() > max_source_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("source_code exceeds {} bytes", max_source_bytes),
        ));
    }
    if request.harness_code.len() > max_source_bytes {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("harness_code exceeds {} bytes", max_source_bytes),
        ));
    }
    if let Some(assignment) = &request.assignment {
        if !assignment.is_well_formed() {
            return Err((
                StatusCode::BAD_REQUEST,
                "assignment chapter and slug must be plain names".to_string(),
            ));
        }
    }
    Ok(())
}

pub(crate) fn poll_status_code(terminal: bool) -> StatusCode {
    if terminal {
        // 286 is inside the valid range, the fallback is never taken
        StatusCode::from_u16(TERMINAL_STATUS_CODE).unwrap_or(StatusCode::OK)
    } else {
        StatusCode::OK
    }
}

/// POST /submissions - Queue a submission for grading
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    if let Err((code, message)) = validate(&payload, state.max_source_bytes) {
        warn!(submission_id = %payload.submission_id, reason = %message, "Submission rejected");
        metrics::record_submission(metrics::OUTCOME_REJECTED);
        return error_response(code, message);
    }

    let job = GradingJob::new(payload.submission_id, payload.source_code, payload.harness_code)
        .with_assignment(payload.assignment);
    let task_id = job.task_id;

    let mut conn = state.redis.clone();
    let pending = TaskRecord::new(task_id, TaskState::Pending);

    let queued = async {
        redis::set_task(&mut conn, &pending, state.result_ttl_secs).await?;
        redis::register_submission(&mut conn, &job, payload.user_id.as_deref()).await?;
        redis::push_job(&mut conn, &job).await
    }
    .await;

    if let Err(e) = queued {
        error!(task_id = %task_id, submission_id = %job.submission_id, error = %e, "Failed to queue job");
        metrics::record_submission(metrics::OUTCOME_FAILED);

        // Give pollers a terminal state instead of a job nobody will run
        let failed = TaskRecord::failure(task_id, None, format!("Failed to queue job: {}", e));
        if let Err(e) = redis::set_task(&mut conn, &failed, state.result_ttl_secs).await {
            error!(task_id = %task_id, error = %e, "Failed to record queueing failure");
        }
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to queue job: {}", e));
    }

    info!(
        task_id = %task_id,
        submission_id = %job.submission_id,
        source_size = job.source_code.len(),
        "Job queued"
    );
    metrics::record_submission(metrics::OUTCOME_ACCEPTED);

    (
        StatusCode::CREATED,
        Json(SubmitResponse {
            submission_id: job.submission_id,
            task_id,
        }),
    )
        .into_response()
}

/// GET /submissions/{id}/status - Poll the grading status of a submission
pub async fn submission_status(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Response {
    let mut conn = state.redis.clone();
    match status::poll(&mut conn, &submission_id).await {
        Ok(Some(outcome)) => {
            metrics::record_poll(outcome.response.status.as_str());
            (poll_status_code(outcome.terminal), Json(outcome.response)).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Unknown submission '{}'", submission_id)),
        Err(e) => {
            error!(submission_id = %submission_id, error = %e, "Failed to poll submission");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to query submission status: {}", e),
            )
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "time": Utc::now() })),
    )
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn metrics_endpoint() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
