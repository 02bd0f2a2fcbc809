/// Job Status Bridge - reconciles a submission record with its job's queue state
///
/// **State machine (per job):**
/// ```text
///   pending ──success──▶ success
///      │
///      └────failure────▶ error
/// ```
/// The persisted status is a one-way latch: once the terminal state of the
/// submission's current job has been written (`settled_task == task_id`),
/// polls only re-read. While a newer job is still queued, a terminal status
/// left by an earlier job is reported as-is and never rewritten to `pending`.
///
/// `reconcile` is pure; `poll` wraps it with the Redis reads and the write.
use crate::redis as store;
use crate::types::{
    grade_pct, JobResult, JobStatus, PollResponse, SubmissionRecord, TaskRecord, TaskState,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Fields to persist on a submission record. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionUpdate {
    pub run_status: Option<JobStatus>,
    pub grade_score: Option<f64>,
    pub grade_total: Option<f64>,
    pub result_output: Option<String>,
    pub settled_task: Option<Uuid>,
}

impl SubmissionUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(status) = self.run_status {
            fields.push(("run_status", status.to_string()));
        }
        if let Some(score) = self.grade_score {
            fields.push(("grade_score", score.to_string()));
        }
        if let Some(total) = self.grade_total {
            fields.push(("grade_total", total.to_string()));
        }
        if let Some(output) = &self.result_output {
            fields.push(("result_output", output.clone()));
        }
        if let Some(task) = self.settled_task {
            fields.push(("settled_task", task.to_string()));
        }
        fields
    }

    /// Grade fields of a finished job, used by both terminal transitions and re-runs
    pub fn from_result(result: &JobResult) -> Self {
        Self {
            run_status: None,
            grade_score: Some(result.grading.verdict.score),
            grade_total: Some(result.grading.verdict.total),
            result_output: Some(result.grading.verdict.output.clone()),
            settled_task: None,
        }
    }
}

/// Outcome of one poll: what to show, what to write, and whether the client can stop polling
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub response: PollResponse,
    pub update: Option<SubmissionUpdate>,
    pub terminal: bool,
}

/// Client view derived from the stored record alone
fn base_response(record: &SubmissionRecord) -> PollResponse {
    let computed_pct = match (record.grade_score, record.grade_total) {
        (Some(score), Some(total)) if total > 0.0 => Some(grade_pct(score, total)),
        _ => None,
    };

    PollResponse {
        state: "none".to_string(),
        status: record.run_status.unwrap_or(JobStatus::Pending),
        user_stdout: String::new(),
        user_stderr: String::new(),
        user_exit_code: None,
        grade_pct: computed_pct,
        score: record.grade_score,
        total: record.grade_total,
        test_output: record.result_output.clone().unwrap_or_default(),
        test_errors: Vec::new(),
        images: Vec::new(),
    }
}

/// Overlay a finished job's payload onto the response
fn apply_payload(response: &mut PollResponse, result: &JobResult) {
    response.user_stdout = result.user.stdout.clone();
    response.user_stderr = result.user.stderr.clone();
    response.user_exit_code = Some(result.user.exit_code);
    response.grade_pct = Some(result.grading.grade_pct);
    response.score = Some(result.grading.verdict.score);
    response.total = Some(result.grading.verdict.total);
    response.test_output = result.grading.verdict.output.clone();
    response.test_errors = result.grading.verdict.errors.clone();
    response.images = result.images.clone();
}

/// Translate the queue state of the submission's current job into a domain status
pub fn reconcile(record: &SubmissionRecord, task: Option<&TaskRecord>) -> PollOutcome {
    let mut response = base_response(record);

    let Some(task_id) = record.task_id else {
        // Nothing was ever queued; there is nothing to wait for.
        return PollOutcome {
            response,
            update: None,
            terminal: true,
        };
    };

    let state = task.map(|t| t.state).unwrap_or(TaskState::Pending);
    response.state = state.to_string();
    let stored = record.run_status;
    let settled = record.settled_task == Some(task_id) && stored.map_or(false, |s| s.is_terminal());

    if settled {
        if let Some(result) = task.and_then(|t| t.result.as_ref()) {
            apply_payload(&mut response, result);
        }
        return PollOutcome {
            response,
            update: None,
            terminal: true,
        };
    }

    match state {
        TaskState::Pending | TaskState::Retry | TaskState::Started => {
            let update = match stored {
                // Latched: a terminal status is never rewritten to pending.
                Some(status) if status.is_terminal() => None,
                Some(JobStatus::Pending) => None,
                _ => Some(SubmissionUpdate {
                    run_status: Some(JobStatus::Pending),
                    ..Default::default()
                }),
            };
            if !stored.map_or(false, |s| s.is_terminal()) {
                response.status = JobStatus::Pending;
            }
            PollOutcome {
                response,
                update,
                terminal: false,
            }
        }
        TaskState::Failure => {
            response.status = JobStatus::Error;
            let mut update = SubmissionUpdate {
                run_status: Some(JobStatus::Error),
                settled_task: Some(task_id),
                ..Default::default()
            };

            match task.and_then(|t| t.result.as_ref()) {
                Some(result) => {
                    apply_payload(&mut response, result);
                    let grades = SubmissionUpdate::from_result(result);
                    update.grade_score = grades.grade_score;
                    update.grade_total = grades.grade_total;
                    update.result_output = grades.result_output;
                }
                None => {
                    response.user_stderr = task
                        .and_then(|t| t.error.clone())
                        .unwrap_or_else(|| "Grading failed".to_string());
                }
            }

            PollOutcome {
                response,
                update: Some(update),
                terminal: true,
            }
        }
        TaskState::Success => {
            response.status = JobStatus::Success;
            let mut update = SubmissionUpdate {
                run_status: Some(JobStatus::Success),
                settled_task: Some(task_id),
                ..Default::default()
            };

            if let Some(result) = task.and_then(|t| t.result.as_ref()) {
                apply_payload(&mut response, result);
                let grades = SubmissionUpdate::from_result(result);
                update.grade_score = grades.grade_score;
                update.grade_total = grades.grade_total;
                update.result_output = grades.result_output;
            }

            PollOutcome {
                response,
                update: Some(update),
                terminal: true,
            }
        }
    }
}

/// Poll a submission: read record and task state, reconcile, persist any transition.
/// Returns `None` for an unknown submission.
pub async fn poll(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
) -> redis::RedisResult<Option<PollOutcome>> {
    let Some(record) = store::get_submission(conn, submission_id).await? else {
        return Ok(None);
    };

    let task = match record.task_id {
        Some(task_id) => store::get_task(conn, &task_id).await?,
        None => None,
    };

    let outcome = reconcile(&record, task.as_ref());

    match &outcome.update {
        Some(update) if !update.is_empty() => {
            store::apply_update(conn, submission_id, update).await?;
            info!(
                submission_id = %submission_id,
                state = %outcome.response.state,
                status = %outcome.response.status,
                "Submission status persisted"
            );
        }
        _ => {
            debug!(
                submission_id = %submission_id,
                state = %outcome.response.state,
                status = %outcome.response.status,
                "Poll without status change"
            );
        }
    }

    Ok(Some(outcome))
}
