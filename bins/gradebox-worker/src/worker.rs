// Queue consumer: pops grading jobs and publishes their terminal state
use crate::config::WorkerConfig;
use crate::orchestrator::Orchestrator;
use gradebox_common::redis;
use gradebox_common::types::{GradingJob, JobResult, ResultStatus, TaskRecord, TaskState};
use tracing::{debug, error, info, instrument, warn};

pub const SOFT_LIMIT_ERROR: &str = "Worker soft time limit exceeded";

/// What to do with a job once the orchestrator is done with it (or gave up)
#[derive(Debug)]
pub enum Disposition {
    /// Store this terminal record and point the submission at it
    Publish(TaskRecord),
    /// Put the job back on the queue for another attempt
    Retry(GradingJob),
}

/// `outcome` is `None` when the job overran the soft time limit.
pub fn dispose(job: &GradingJob, outcome: Option<JobResult>, max_retries: u32) -> Disposition {
    match outcome {
        Some(result) if result.status == ResultStatus::Success => {
            Disposition::Publish(TaskRecord::success(result))
        }
        Some(result) => {
            if job.attempt < max_retries {
                let mut retry = job.clone();
                retry.attempt += 1;
                return Disposition::Retry(retry);
            }
            let diagnostic = result
                .grading
                .verdict
                .errors
                .first()
                .cloned()
                .unwrap_or_else(|| "Grading failed".to_string());
            Disposition::Publish(TaskRecord::failure(job.task_id, Some(result), diagnostic))
        }
        None => Disposition::Publish(TaskRecord::failure(job.task_id, None, SOFT_LIMIT_ERROR)),
    }
}

#[instrument(skip_all)]
pub async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    orchestrator: &Orchestrator,
    config: &WorkerConfig,
    result_ttl_secs: u64,
) -> anyhow::Result<()> {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                info!(
                    task_id = %job.task_id,
                    submission_id = %job.submission_id,
                    attempt = job.attempt,
                    source_size = job.source_code.len(),
                    "Received job"
                );
                process_job(redis_conn, orchestrator, config, result_ttl_secs, job).await;
            }
            Ok(None) => {
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_job(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    orchestrator: &Orchestrator,
    config: &WorkerConfig,
    result_ttl_secs: u64,
    job: GradingJob,
) {
    let task_id = job.task_id;

    if let Err(e) = redis::set_task(redis_conn, &TaskRecord::new(task_id, TaskState::Started), result_ttl_secs).await {
        warn!(task_id = %task_id, error = %e, "Failed to mark job as started");
    }

    let start = std::time::Instant::now();
    let soft_limit = config.timeouts.soft_limit();
    // Dropping the orchestrator future on expiry removes its workspace and containers
    let outcome = match tokio::time::timeout(soft_limit, orchestrator.run(&job)).await {
        Ok(result) => Some(result),
        Err(_) => {
            error!(task_id = %task_id, limit_secs = soft_limit.as_secs(), "Job exceeded soft time limit");
            None
        }
    };
    debug!(task_id = %task_id, elapsed_ms = start.elapsed().as_millis() as u64, "Job finished");

    match dispose(&job, outcome, config.max_retries) {
        Disposition::Retry(retry) => {
            warn!(task_id = %task_id, attempt = retry.attempt, "Job failed on infrastructure, requeueing");
            let record = TaskRecord::new(task_id, TaskState::Retry);
            if let Err(e) = redis::set_task(redis_conn, &record, result_ttl_secs).await {
                error!(task_id = %task_id, error = %e, "Failed to mark job for retry");
            }
            if let Err(e) = redis::push_job(redis_conn, &retry).await {
                error!(task_id = %task_id, error = %e, "Failed to requeue job");
            }
        }
        Disposition::Publish(record) => {
            let state = record.state;
            match redis::set_task(redis_conn, &record, result_ttl_secs).await {
                Ok(()) => info!(task_id = %task_id, state = %state, "Result published"),
                Err(e) => {
                    // Non-fatal - worker continues
                    error!(task_id = %task_id, error = %e, "Failed to publish result");
                    return;
                }
            }
            if let Err(e) = redis::claim_submission(redis_conn, &job.submission_id, &task_id).await {
                error!(task_id = %task_id, error = %e, "Failed to claim submission");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gradebox_common::types::{GradingVerdict, PhaseExecutionResult};

    fn result_for(job: &GradingJob, status: ResultStatus, errors: Vec<String>) -> JobResult {
        JobResult {
            task_id: job.task_id,
            submission_id: job.submission_id.clone(),
            status,
            user: PhaseExecutionResult::not_run(""),
            grading: GradingVerdict::zero("", errors).into(),
            images: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_success_is_published() {
        let job = GradingJob::new("1", "", "");
        let result = result_for(&job, ResultStatus::Success, vec![]);
        match dispose(&job, Some(result), 2) {
            Disposition::Publish(record) => {
                assert_eq!(record.state, TaskState::Success);
                assert_eq!(record.task_id, job.task_id);
                assert!(record.result.is_some());
            }
            other => panic!("expected publish, got {:?}", other),
        }
    }

    #[test]
    fn test_error_without_retries_is_a_failure_with_payload() {
        let job = GradingJob::new("1", "", "");
        let result = result_for(&job, ResultStatus::Error, vec!["docker down".to_string()]);
        match dispose(&job, Some(result), 0) {
            Disposition::Publish(record) => {
                assert_eq!(record.state, TaskState::Failure);
                assert_eq!(record.error.as_deref(), Some("docker down"));
                assert!(record.result.is_some());
            }
            other => panic!("expected publish, got {:?}", other),
        }
    }

    #[test]
    fn test_error_is_retried_while_attempts_remain() {
        let job = GradingJob::new("1", "", "");
        let result = result_for(&job, ResultStatus::Error, vec![]);
        match dispose(&job, Some(result), 1) {
            Disposition::Retry(retry) => {
                assert_eq!(retry.attempt, 1);
                assert_eq!(retry.task_id, job.task_id);
            }
            other => panic!("expected retry, got {:?}", other),
        }

        let mut last = GradingJob::new("1", "", "");
        last.attempt = 1;
        let result = result_for(&last, ResultStatus::Error, vec![]);
        assert!(matches!(dispose(&last, Some(result), 1), Disposition::Publish(_)));
    }

    #[test]
    fn test_soft_limit_is_a_failure_without_payload() {
        let job = GradingJob::new("1", "", "");
        match dispose(&job, None, 3) {
            Disposition::Publish(record) => {
                assert_eq!(record.state, TaskState::Failure);
                assert!(record.result.is_none());
                assert_eq!(record.error.as_deref(), Some(SOFT_LIMIT_ERROR));
            }
            other => panic!("expected publish, got {:?}", other),
        }
    }
}
