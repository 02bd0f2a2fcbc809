use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Exit code recorded when no process exit status was observed
/// (the phase timed out or never launched)
pub const TIMEOUT_EXIT_CODE: i64 = -1;

/// Percentage reported when the harness declares no achievable points
pub const DEFAULT_GRADE_PCT: f64 = 0.0;

/// Chapter/assignment pair used to locate auxiliary input files and harnesses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRef {
    pub chapter: String,
    pub slug: String,
}

impl AssignmentRef {
    /// Both parts must be single path components so they stay inside the content tree
    pub fn is_well_formed(&self) -> bool {
        is_path_component(&self.chapter) && is_path_component(&self.slug)
    }
}

fn is_path_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains('/') && !part.contains('\\')
}

/// One unit of work delivered to a worker through the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingJob {
    pub task_id: Uuid,
    pub submission_id: String,
    pub source_code: String,
    pub harness_code: String,
    #[serde(default)]
    pub assignment: Option<AssignmentRef>,
    pub created_at: DateTime<Utc>,
    /// Number of times this job has already been re-queued
    #[serde(default)]
    pub attempt: u32,
}

impl GradingJob {
    pub fn new(
        submission_id: impl Into<String>,
        source_code: impl Into<String>,
        harness_code: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            submission_id: submission_id.into(),
            source_code: source_code.into(),
            harness_code: harness_code.into(),
            assignment: None,
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    pub fn with_assignment(mut self, assignment: Option<AssignmentRef>) -> Self {
        self.assignment = assignment;
        self
    }
}

/// Captured outcome of one sandboxed phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecutionResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl PhaseExecutionResult {
    pub fn timed_out(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms,
            timed_out: true,
        }
    }

    /// Placeholder for a phase that never launched
    pub fn not_run(diagnostic: impl Into<String>) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: diagnostic.into(),
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Image produced by the student program and returned to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub data_uri: String,
}

/// Normalized harness verdict. `score` may exceed `total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingVerdict {
    pub score: f64,
    pub total: f64,
    pub output: String,
    pub errors: Vec<String>,
}

impl GradingVerdict {
    pub fn zero(output: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            score: 0.0,
            total: 0.0,
            output: output.into(),
            errors,
        }
    }
}

/// `round(100 * score / total, 2)`, or [`DEFAULT_GRADE_PCT`] when nothing is achievable
/// or the ratio is not representable (JSON has no infinity)
pub fn grade_pct(score: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return DEFAULT_GRADE_PCT;
    }
    let pct = (100.0 * score / total * 100.0).round() / 100.0;
    if pct.is_finite() {
        pct
    } else {
        DEFAULT_GRADE_PCT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grading {
    pub grade_pct: f64,
    #[serde(flatten)]
    pub verdict: GradingVerdict,
}

impl From<GradingVerdict> for Grading {
    fn from(verdict: GradingVerdict) -> Self {
        Self {
            grade_pct: grade_pct(verdict.score, verdict.total),
            verdict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Terminal payload of one grading job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub task_id: Uuid,
    pub submission_id: String,
    pub status: ResultStatus,
    pub user: PhaseExecutionResult,
    pub grading: Grading,
    pub images: Vec<Artifact>,
    pub finished_at: DateTime<Utc>,
}

/// Persisted, client-facing status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Lifecycle of a job as seen by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Started => "started",
            TaskState::Retry => "retry",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-side record of a job. A missing record reads as `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: Uuid, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn success(result: JobResult) -> Self {
        Self {
            task_id: result.task_id,
            state: TaskState::Success,
            result: Some(result),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn failure(task_id: Uuid, result: Option<JobResult>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            state: TaskState::Failure,
            result,
            error: Some(error.into()),
            updated_at: Utc::now(),
        }
    }
}

/// Durable per-submission record owned by the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionRecord {
    pub submission_id: String,
    pub user_id: Option<String>,
    pub assignment: Option<AssignmentRef>,
    pub answer_script: String,
    pub task_id: Option<Uuid>,
    pub run_status: Option<JobStatus>,
    pub grade_score: Option<f64>,
    pub grade_total: Option<f64>,
    pub result_output: Option<String>,
    /// Job whose terminal state has already been persisted
    pub settled_task: Option<Uuid>,
}

impl SubmissionRecord {
    /// Rebuild a record from its Redis hash fields. Unparseable values read as absent.
    pub fn from_fields(submission_id: &str, fields: &HashMap<String, String>) -> Self {
        let get = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
        let assignment = match (get("chapter"), get("assignment")) {
            (Some(chapter), Some(slug)) => Some(AssignmentRef { chapter, slug }),
            _ => None,
        };

        Self {
            submission_id: submission_id.to_string(),
            user_id: get("user_id"),
            assignment,
            answer_script: get("answer_script").unwrap_or_default(),
            task_id: get("task_id").and_then(|v| Uuid::parse_str(&v).ok()),
            run_status: get("run_status").and_then(|v| v.parse().ok()),
            grade_score: get("grade_score").and_then(|v| v.parse().ok()),
            grade_total: get("grade_total").and_then(|v| v.parse().ok()),
            result_output: fields.get("result_output").cloned(),
            settled_task: get("settled_task").and_then(|v| Uuid::parse_str(&v).ok()),
        }
    }
}

/// Body returned to a polling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub state: String,
    pub status: JobStatus,
    pub user_stdout: String,
    pub user_stderr: String,
    pub user_exit_code: Option<i64>,
    pub grade_pct: Option<f64>,
    pub score: Option<f64>,
    pub total: Option<f64>,
    pub test_output: String,
    pub test_errors: Vec<String>,
    pub images: Vec<Artifact>,
}
