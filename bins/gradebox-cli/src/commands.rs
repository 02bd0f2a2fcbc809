// CLI commands for operating Gradebox
use anyhow::{bail, Context, Result};
use gradebox_common::config::Config;
use gradebox_common::redis;
use gradebox_common::status::{poll, SubmissionUpdate};
use gradebox_common::types::{AssignmentRef, GradingJob, SubmissionRecord, TaskRecord, TaskState};
use ::redis::aio::ConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_ROOT: &str = "/app/python_course_repo";
const HARNESS_FILE: &str = "test_runner.py";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which submissions a re-run applies to. Unset fields match everything.
#[derive(Debug, Default)]
pub struct RerunFilter {
    pub submission: Option<String>,
    pub assignment: Option<String>,
    pub user: Option<String>,
}

impl RerunFilter {
    pub fn matches(&self, record: &SubmissionRecord) -> bool {
        if let Some(id) = &self.submission {
            if &record.submission_id != id {
                return false;
            }
        }
        if let Some(slug) = &self.assignment {
            if record.assignment.as_ref().map(|a| &a.slug) != Some(slug) {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if record.user_id.as_ref() != Some(user) {
                return false;
            }
        }
        true
    }
}

fn content_root() -> PathBuf {
    std::env::var("LOCAL_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONTENT_ROOT))
}

pub fn harness_path(content_root: &Path, assignment: &AssignmentRef) -> PathBuf {
    content_root
        .join(&assignment.chapter)
        .join(&assignment.slug)
        .join(HARNESS_FILE)
}

/// Current harness for an assignment; an unreadable harness grades with an empty one
pub fn load_harness(content_root: &Path, assignment: Option<&AssignmentRef>) -> String {
    let Some(assignment) = assignment else {
        println!("⚠️  No assignment recorded, using an empty harness");
        return String::new();
    };
    if !assignment.is_well_formed() {
        println!("⚠️  Malformed assignment {}/{}, using an empty harness", assignment.chapter, assignment.slug);
        return String::new();
    }

    let path = harness_path(content_root, assignment);
    match fs::read_to_string(&path) {
        Ok(harness) => harness,
        Err(e) => {
            println!("⚠️  {}: {}", path.display(), e);
            String::new()
        }
    }
}

async fn connect() -> Result<(ConnectionManager, Config)> {
    let config = Config::from_env();
    let conn = config
        .connect()
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    Ok((conn, config))
}

/// Poll the task record until it is terminal or `wait` has elapsed
async fn wait_for_task(
    conn: &mut ConnectionManager,
    task_id: &Uuid,
    wait: Duration,
) -> Result<Option<TaskRecord>> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(record) = redis::get_task(conn, task_id).await? {
            if record.state.is_terminal() {
                return Ok(Some(record));
            }
            debug!(task_id = %task_id, state = %record.state, "Waiting for job");
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Re-run the autograder for every submission matching `filter`
pub async fn rerun(filter: &RerunFilter, wait: Duration) -> Result<()> {
    let (mut conn, config) = connect().await?;
    let content_root = content_root();

    let ids = match &filter.submission {
        Some(id) => vec![id.clone()],
        None => redis::list_submission_ids(&mut conn)
            .await
            .context("Failed to list submissions")?,
    };

    let mut rerun_count = 0;
    for id in ids {
        let Some(record) = redis::get_submission(&mut conn, &id).await? else {
            warn!(submission_id = %id, "Submission not found");
            continue;
        };
        if !filter.matches(&record) {
            continue;
        }

        println!(
            "🔁 Assignment: {}",
            record.assignment.as_ref().map(|a| a.slug.as_str()).unwrap_or("-")
        );
        println!("   Sub ID: {}", record.submission_id);

        let harness = load_harness(&content_root, record.assignment.as_ref());
        let job = GradingJob::new(record.submission_id.clone(), record.answer_script.clone(), harness)
            .with_assignment(record.assignment.clone());
        let task_id = job.task_id;

        redis::set_task(&mut conn, &TaskRecord::new(task_id, TaskState::Pending), config.result_ttl_secs)
            .await?;
        redis::register_submission(&mut conn, &job, record.user_id.as_deref()).await?;
        redis::push_job(&mut conn, &job).await.context("Failed to queue job")?;
        rerun_count += 1;

        let Some(task) = wait_for_task(&mut conn, &task_id, wait).await? else {
            println!("   ⏱️  No result after {}s, leaving job {} queued", wait.as_secs(), task_id);
            continue;
        };

        match &task.result {
            Some(result) => {
                redis::apply_update(&mut conn, &record.submission_id, &SubmissionUpdate::from_result(result))
                    .await?;
                println!("   Score: {}", result.grading.verdict.score);
                println!("   Total: {}", result.grading.verdict.total);
                println!("   Output: {}", result.grading.verdict.output);
            }
            None => {
                println!(
                    "   ❌ Failed: {}",
                    task.error.as_deref().unwrap_or("no result was produced")
                );
            }
        }
    }

    println!("✅ Done. {} submission(s) re-run.", rerun_count);
    Ok(())
}

/// Run one reconcile poll and print the response as JSON
pub async fn status(submission_id: &str) -> Result<()> {
    let (mut conn, _) = connect().await?;

    let Some(outcome) = poll(&mut conn, submission_id).await? else {
        bail!("Unknown submission '{}'", submission_id);
    };

    println!("{}", serde_json::to_string_pretty(&outcome.response)?);
    if !outcome.terminal {
        println!("(job still {})", outcome.response.state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, slug: &str, user: &str) -> SubmissionRecord {
        SubmissionRecord {
            submission_id: id.to_string(),
            user_id: Some(user.to_string()),
            assignment: Some(AssignmentRef {
                chapter: "basics".to_string(),
                slug: slug.to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(RerunFilter::default().matches(&record("1", "loops", "u1")));
        assert!(RerunFilter::default().matches(&SubmissionRecord::default()));
    }

    #[test]
    fn test_filters_combine() {
        let filter = RerunFilter {
            assignment: Some("loops".to_string()),
            user: Some("u1".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record("1", "loops", "u1")));
        assert!(!filter.matches(&record("2", "loops", "u2")));
        assert!(!filter.matches(&record("3", "strings", "u1")));
        assert!(!filter.matches(&SubmissionRecord::default()));
    }

    #[test]
    fn test_submission_filter() {
        let filter = RerunFilter {
            submission: Some("7".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record("7", "loops", "u1")));
        assert!(!filter.matches(&record("8", "loops", "u1")));
    }

    #[test]
    fn test_harness_is_loaded_from_content_root() {
        let root = tempfile::tempdir().unwrap();
        let assignment = AssignmentRef {
            chapter: "basics".to_string(),
            slug: "loops".to_string(),
        };
        let dir = root.path().join("basics").join("loops");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(HARNESS_FILE), "print('{}')").unwrap();

        assert_eq!(load_harness(root.path(), Some(&assignment)), "print('{}')");
    }

    #[test]
    fn test_missing_harness_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let assignment = AssignmentRef {
            chapter: "basics".to_string(),
            slug: "missing".to_string(),
        };
        assert_eq!(load_harness(root.path(), Some(&assignment)), "");
        assert_eq!(load_harness(root.path(), None), "");
    }

    #[test]
    fn test_harness_outside_content_root_is_not_read() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("content");
        fs::create_dir_all(&root).unwrap();
        let outside = base.path().join("private");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join(HARNESS_FILE), "print('leaked')").unwrap();

        let assignment = AssignmentRef {
            chapter: "..".to_string(),
            slug: "private".to_string(),
        };
        assert_eq!(load_harness(&root, Some(&assignment)), "");
    }
}
