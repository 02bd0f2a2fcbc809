use crate::status::SubmissionUpdate;
use crate::types::{GradingJob, JobStatus, SubmissionRecord, TaskRecord};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Redis layout - the single place API, worker and CLI agree on key names
///
/// - `gradebox:queue` list of serialized GradingJobs (FIFO)
/// - `gradebox:task:{task_id}` queue-side TaskRecord (JSON, TTL)
/// - `gradebox:submission:{id}` hash with the durable submission record

pub const QUEUE_KEY: &str = "gradebox:queue";
pub const TASK_PREFIX: &str = "gradebox:task";
pub const SUBMISSION_PREFIX: &str = "gradebox:submission";

/// Generate task record key for a job
pub fn task_key(task_id: &Uuid) -> String {
    format!("{}:{}", TASK_PREFIX, task_id)
}

/// Generate record key for a submission
pub fn submission_key(submission_id: &str) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, submission_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn deserialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Push a job to the grading queue
/// Uses RPUSH for FIFO semantics
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradingJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a job from the grading queue
/// Uses BLPOP with timeout for graceful shutdown
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<GradingJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradingJob = serde_json::from_str(&payload).map_err(deserialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store the queue-side state of a job, replacing any previous state
pub async fn set_task(
    conn: &mut redis::aio::ConnectionManager,
    record: &TaskRecord,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = serde_json::to_string(record).map_err(serialization_error)?;
    redis::cmd("SET")
        .arg(task_key(&record.task_id))
        .arg(payload)
        .arg("EX")
        .arg(ttl_secs)
        .query_async(conn)
        .await
}

/// Retrieve the queue-side state of a job; `None` means nothing was recorded yet
pub async fn get_task(
    conn: &mut redis::aio::ConnectionManager,
    task_id: &Uuid,
) -> RedisResult<Option<TaskRecord>> {
    let payload: Option<String> = conn.get(task_key(task_id)).await?;

    match payload {
        Some(data) => {
            let record: TaskRecord = serde_json::from_str(&data).map_err(deserialization_error)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Record a newly submitted job against its submission.
///
/// The submission's `task_id` now points at the new job. `run_status` is only
/// initialised when absent so a terminal status is never regressed here.
pub async fn register_submission(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradingJob,
    user_id: Option<&str>,
) -> RedisResult<()> {
    let key = submission_key(&job.submission_id);
    let mut fields: Vec<(&str, String)> = vec![
        ("answer_script", job.source_code.clone()),
        ("task_id", job.task_id.to_string()),
    ];
    if let Some(user_id) = user_id {
        fields.push(("user_id", user_id.to_string()));
    }
    if let Some(assignment) = &job.assignment {
        fields.push(("chapter", assignment.chapter.clone()));
        fields.push(("assignment", assignment.slug.clone()));
    }

    let _: () = conn.hset_multiple(&key, &fields).await?;
    let _: bool = conn.hset_nx(&key, "run_status", JobStatus::Pending.as_str()).await?;
    Ok(())
}

/// Point a submission at a job that just reached a terminal queue state,
/// so the most recently completed job is the one polls reconcile
pub async fn claim_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
    task_id: &Uuid,
) -> RedisResult<()> {
    conn.hset(submission_key(submission_id), "task_id", task_id.to_string()).await
}

/// Load a submission record; `None` if the submission is unknown
pub async fn get_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
) -> RedisResult<Option<SubmissionRecord>> {
    let fields: HashMap<String, String> = conn.hgetall(submission_key(submission_id)).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(SubmissionRecord::from_fields(submission_id, &fields)))
}

/// Write the present fields of an update; absent fields stay untouched
pub async fn apply_update(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &str,
    update: &SubmissionUpdate,
) -> RedisResult<()> {
    let fields = update.fields();
    if fields.is_empty() {
        return Ok(());
    }
    conn.hset_multiple(submission_key(submission_id), &fields).await
}

/// List every known submission id
pub async fn list_submission_ids(
    conn: &mut redis::aio::ConnectionManager,
) -> RedisResult<Vec<String>> {
    let pattern = format!("{}:*", SUBMISSION_PREFIX);
    let prefix_len = SUBMISSION_PREFIX.len() + 1;

    let mut keys: Vec<String> = Vec::new();
    {
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
    }

    let mut ids: Vec<String> = keys.into_iter().map(|k| k[prefix_len..].to_string()).collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}
