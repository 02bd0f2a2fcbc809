/// Execution Orchestrator - runs one grading job end to end
///
/// **Architecture:**
/// 1. Prepare an exclusive workspace (student file, auxiliary inputs)
/// 2. Phase A: run the student program alone, workspace writable
/// 3. Collect generated images before anything else can touch them
/// 4. Write the harness over whatever Phase A left at its name
/// 5. Phase B: run the harness, workspace read-only
/// 6. Normalize the harness verdict and assemble the JobResult
///
/// Phase B always runs, whatever Phase A did: partial credit is graded.
/// Only a sandbox launch failure (or workspace setup failure) stops the
/// pipeline, and even then a JobResult with status `error` is produced.
/// The workspace is removed on every path.
use crate::artifacts;
use crate::config::WorkerConfig;
use crate::normalizer;
use crate::sandbox::Sandbox;
use crate::workspace::{Workspace, WorkspaceError, HARNESS_FILE, SOURCE_FILE};
use chrono::Utc;
use gradebox_common::types::{
    Artifact, GradingJob, GradingVerdict, JobResult, PhaseExecutionResult, ResultStatus,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

const STUDENT_TIMEOUT_MESSAGE: &str = "Timed out while running the student program.";

/// Lifecycle of one job inside the worker. Transitions are strictly forward;
/// `Failed` can be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Created,
    WorkspacePrepared,
    PhaseARunning,
    PhaseADone,
    ArtifactsScanned,
    PhaseBRunning,
    PhaseBDone,
    Published,
    Failed,
}

impl JobPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Published | JobPhase::Failed)
    }

    fn next(&self) -> Option<JobPhase> {
        use JobPhase::*;
        match self {
            Created => Some(WorkspacePrepared),
            WorkspacePrepared => Some(PhaseARunning),
            PhaseARunning => Some(PhaseADone),
            PhaseADone => Some(ArtifactsScanned),
            ArtifactsScanned => Some(PhaseBRunning),
            PhaseBRunning => Some(PhaseBDone),
            PhaseBDone => Some(Published),
            Published | Failed => None,
        }
    }

    pub fn can_advance_to(&self, to: JobPhase) -> bool {
        if to == JobPhase::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(to)
    }
}

/// Tracks and logs the phase of the job being executed
struct JobProgress<'a> {
    submission_id: &'a str,
    phase: JobPhase,
}

impl<'a> JobProgress<'a> {
    fn new(submission_id: &'a str) -> Self {
        Self {
            submission_id,
            phase: JobPhase::Created,
        }
    }

    fn advance(&mut self, to: JobPhase) {
        debug_assert!(
            self.phase.can_advance_to(to),
            "illegal job transition {:?} -> {:?}",
            self.phase,
            to
        );
        debug!(submission_id = %self.submission_id, from = ?self.phase, to = ?to, "Job transition");
        self.phase = to;
    }
}

pub struct Orchestrator {
    sandbox: Box<dyn Sandbox>,
    config: WorkerConfig,
}

impl Orchestrator {
    pub fn new(sandbox: Box<dyn Sandbox>, config: WorkerConfig) -> Self {
        Self { sandbox, config }
    }

    /// Execute a job and return its terminal payload. Never fails.
    #[tracing::instrument(skip(self, job), fields(submission_id = %job.submission_id, task_id = %job.task_id))]
    pub async fn run(&self, job: &GradingJob) -> JobResult {
        let mut progress = JobProgress::new(&job.submission_id);

        let workspace = match self.prepare_workspace(job) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "Workspace preparation failed");
                progress.advance(JobPhase::Failed);
                let diagnostic = format!("Could not prepare workspace: {}", e);
                return failed(job, PhaseExecutionResult::not_run(diagnostic.clone()), Vec::new(), diagnostic);
            }
        };
        progress.advance(JobPhase::WorkspacePrepared);

        let result = self.run_phases(job, &workspace, &mut progress).await;

        workspace.close();

        if progress.phase == JobPhase::PhaseBDone {
            progress.advance(JobPhase::Published);
        }
        result
    }

    fn prepare_workspace(&self, job: &GradingJob) -> Result<Workspace, WorkspaceError> {
        let workspace = Workspace::create(&self.config.paths.workspace_root, &job.submission_id)?;

        match &job.assignment {
            Some(assignment) if !assignment.is_well_formed() => {
                warn!(chapter = %assignment.chapter, slug = %assignment.slug, "Malformed assignment, skipping auxiliary files");
            }
            Some(assignment) => {
                let source_dir = self
                    .config
                    .paths
                    .content_root
                    .join(&assignment.chapter)
                    .join(&assignment.slug);
                let copied = workspace.copy_auxiliary(&source_dir, &self.config.paths.auxiliary_extensions);
                debug!(copied, dir = %source_dir.display(), "Auxiliary files copied");
            }
            None => {}
        }

        // Written after course files so they can never shadow it
        workspace.write_file(SOURCE_FILE, &job.source_code)?;
        Ok(workspace)
    }

    async fn run_phases(
        &self,
        job: &GradingJob,
        workspace: &Workspace,
        progress: &mut JobProgress<'_>,
    ) -> JobResult {
        let timeouts = &self.config.timeouts;
        let env = HashMap::new();

        // Phase A: student code alone
        progress.advance(JobPhase::PhaseARunning);
        let user = match self
            .sandbox
            .run(SOURCE_FILE, workspace.path(), true, timeouts.student(), &env)
            .await
        {
            Ok(mut run) => {
                if run.timed_out {
                    run.stderr = STUDENT_TIMEOUT_MESSAGE.to_string();
                    warn!(duration_ms = run.duration_ms, "Student program timed out");
                } else {
                    info!(exit_code = run.exit_code, duration_ms = run.duration_ms, "Student program finished");
                }
                run
            }
            Err(e) => {
                error!(error = %e, "Phase A could not be launched");
                progress.advance(JobPhase::Failed);
                let diagnostic = e.to_string();
                return failed(job, PhaseExecutionResult::not_run(diagnostic.clone()), Vec::new(), diagnostic);
            }
        };
        progress.advance(JobPhase::PhaseADone);

        let images = artifacts::collect(workspace.path(), &self.config.artifacts);
        debug!(images = images.len(), "Artifacts collected");
        progress.advance(JobPhase::ArtifactsScanned);

        // The harness only enters the workspace once the student can no longer write to it
        if let Err(e) = workspace.replace_file(HARNESS_FILE, &job.harness_code) {
            error!(error = %e, "Test runner could not be written");
            progress.advance(JobPhase::Failed);
            return failed(job, user, images, format!("Could not prepare workspace: {}", e));
        }

        // Phase B: harness, regardless of how Phase A ended
        progress.advance(JobPhase::PhaseBRunning);
        let verdict = match self
            .sandbox
            .run(HARNESS_FILE, workspace.path(), false, timeouts.harness(), &env)
            .await
        {
            Ok(run) if run.timed_out => {
                warn!(duration_ms = run.duration_ms, "Test runner timed out");
                normalizer::timed_out()
            }
            Ok(run) => {
                debug!(exit_code = run.exit_code, duration_ms = run.duration_ms, "Test runner finished");
                normalizer::normalize(&run.stdout, &run.stderr)
            }
            Err(e) => {
                error!(error = %e, "Phase B could not be launched");
                progress.advance(JobPhase::Failed);
                return failed(job, user, images, e.to_string());
            }
        };
        progress.advance(JobPhase::PhaseBDone);

        let result = JobResult {
            task_id: job.task_id,
            submission_id: job.submission_id.clone(),
            status: ResultStatus::Success,
            user,
            grading: verdict.into(),
            images,
            finished_at: Utc::now(),
        };

        info!(
            score = result.grading.verdict.score,
            total = result.grading.verdict.total,
            grade_pct = result.grading.grade_pct,
            "Grading completed"
        );
        result
    }
}

/// Terminal payload for a job that could not run to completion
fn failed(
    job: &GradingJob,
    user: PhaseExecutionResult,
    images: Vec<Artifact>,
    diagnostic: String,
) -> JobResult {
    JobResult {
        task_id: job.task_id,
        submission_id: job.submission_id.clone(),
        status: ResultStatus::Error,
        user,
        grading: GradingVerdict::zero("", vec![diagnostic]).into(),
        images,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LaunchError;
    use async_trait::async_trait;
    use base64::{engine::general_purpose, Engine as _};
    use gradebox_common::types::{AssignmentRef, TIMEOUT_EXIT_CODE};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Step {
        Exit {
            code: i64,
            stdout: &'static str,
            stderr: &'static str,
        },
        TimedOut,
        LaunchFailure,
    }

    #[derive(Debug, Clone)]
    struct Call {
        entrypoint: String,
        workspace: PathBuf,
        writable: bool,
        files: Vec<String>,
        harness: Option<String>,
    }

    /// Plays back a fixed outcome per phase and records what it was asked to run
    struct ScriptedSandbox {
        student: Step,
        harness: Step,
        student_writes: Vec<(&'static str, &'static [u8])>,
        harness_writes: Vec<(&'static str, &'static [u8])>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedSandbox {
        fn new(student: Step, harness: Step) -> Self {
            Self {
                student,
                harness,
                student_writes: Vec::new(),
                harness_writes: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Sandbox for std::sync::Arc<ScriptedSandbox> {
        async fn run(
            &self,
            entrypoint: &str,
            workspace: &Path,
            writable: bool,
            timeout: Duration,
            _env: &HashMap<String, String>,
        ) -> Result<PhaseExecutionResult, LaunchError> {
            let mut files: Vec<String> = fs::read_dir(workspace)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            files.sort();
            let harness = fs::read_to_string(workspace.join(HARNESS_FILE)).ok();
            self.calls.lock().unwrap().push(Call {
                entrypoint: entrypoint.to_string(),
                workspace: workspace.to_path_buf(),
                writable,
                files,
                harness,
            });

            let (step, writes) = if entrypoint == SOURCE_FILE {
                (&self.student, &self.student_writes)
            } else {
                (&self.harness, &self.harness_writes)
            };
            for (name, data) in writes {
                fs::write(workspace.join(name), data).unwrap();
            }

            match step.clone() {
                Step::Exit { code, stdout, stderr } => Ok(PhaseExecutionResult {
                    exit_code: code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    duration_ms: 5,
                    timed_out: false,
                }),
                Step::TimedOut => Ok(PhaseExecutionResult::timed_out(
                    "Timed out",
                    timeout.as_millis() as u64,
                )),
                Step::LaunchFailure => Err(LaunchError::Infrastructure("docker daemon unavailable".to_string())),
            }
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        config: WorkerConfig,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let mut config = WorkerConfig::default();
        config.paths.workspace_root = root.path().join("workspaces");
        config.paths.content_root = root.path().join("content");
        Fixture { root, config }
    }

    fn ok(stdout: &'static str) -> Step {
        Step::Exit { code: 0, stdout, stderr: "" }
    }

    const GOOD_VERDICT: &str = r#"{"score":8,"total":10,"output":"ok","errors":[]}"#;

    async fn run_with(
        sandbox: ScriptedSandbox,
        config: &WorkerConfig,
        job: &GradingJob,
    ) -> (JobResult, Vec<Call>) {
        let sandbox = std::sync::Arc::new(sandbox);
        let orchestrator = Orchestrator::new(Box::new(sandbox.clone()), config.clone());
        let result = orchestrator.run(job).await;
        let calls = sandbox.calls.lock().unwrap().clone();
        (result, calls)
    }

    fn job() -> GradingJob {
        GradingJob::new("7", "print('hello')", "print('{}')")
    }

    #[tokio::test]
    async fn test_correct_submission_is_graded() {
        let fx = fixture();
        let sandbox = ScriptedSandbox::new(ok("hello\n"), ok(GOOD_VERDICT));
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.grading.grade_pct, 80.0);
        assert!(result.grading.verdict.errors.is_empty());
        assert_eq!(result.user.stdout, "hello\n");
        assert_eq!(result.user.exit_code, 0);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].entrypoint, SOURCE_FILE);
        assert!(calls[0].writable);
        assert_eq!(calls[1].entrypoint, HARNESS_FILE);
        assert!(!calls[1].writable);
        assert_eq!(calls[0].workspace, calls[1].workspace);
        assert_eq!(calls[0].files, vec![SOURCE_FILE.to_string()]);
        assert_eq!(calls[1].harness.as_deref(), Some("print('{}')"));
        assert!(!calls[0].workspace.exists(), "workspace must be removed");
    }

    #[tokio::test]
    async fn test_student_timeout_still_runs_harness() {
        let fx = fixture();
        let sandbox = ScriptedSandbox::new(Step::TimedOut, ok(r#"{"score":2,"total":10}"#));
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert!(result.user.timed_out);
        assert_eq!(result.user.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.user.stderr, STUDENT_TIMEOUT_MESSAGE);
        assert_eq!(calls.len(), 2);
        assert_eq!(result.grading.verdict.score, 2.0);
        assert_eq!(result.grading.grade_pct, 20.0);
        assert!(!calls[0].workspace.exists());
    }

    #[tokio::test]
    async fn test_student_crash_still_runs_harness() {
        let fx = fixture();
        let student = Step::Exit {
            code: 1,
            stdout: "",
            stderr: "ZeroDivisionError",
        };
        let sandbox = ScriptedSandbox::new(student, ok(r#"{"score":1,"total":4}"#));
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(calls.len(), 2);
        assert_eq!(result.user.exit_code, 1);
        assert_eq!(result.user.stderr, "ZeroDivisionError");
        assert_eq!(result.grading.grade_pct, 25.0);
    }

    #[tokio::test]
    async fn test_harness_without_output() {
        let fx = fixture();
        let harness = Step::Exit {
            code: 1,
            stdout: "",
            stderr: "ImportError: no module named user_submission\n",
        };
        let sandbox = ScriptedSandbox::new(ok(""), harness);
        let (result, _) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(
            result.grading.verdict,
            GradingVerdict::zero(
                "",
                vec![
                    "Test runner produced no output".to_string(),
                    "ImportError: no module named user_submission".to_string()
                ]
            )
        );
        assert_eq!(result.grading.grade_pct, 0.0);
    }

    #[tokio::test]
    async fn test_harness_timeout() {
        let fx = fixture();
        let sandbox = ScriptedSandbox::new(ok(""), Step::TimedOut);
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.grading.verdict.errors, vec![normalizer::HARNESS_TIMEOUT_ERROR]);
        assert!(!calls[1].workspace.exists());
    }

    #[tokio::test]
    async fn test_student_launch_failure_is_a_job_error() {
        let fx = fixture();
        let sandbox = ScriptedSandbox::new(Step::LaunchFailure, ok(GOOD_VERDICT));
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(calls.len(), 1, "harness must not run after an infrastructure fault");
        assert!(!result.user.timed_out);
        assert_eq!(result.grading.verdict.score, 0.0);
        assert!(result.grading.verdict.errors[0].contains("docker daemon unavailable"));
        assert!(!calls[0].workspace.exists());
    }

    #[tokio::test]
    async fn test_harness_launch_failure_keeps_student_run() {
        let fx = fixture();
        let sandbox = ScriptedSandbox::new(ok("partial"), Step::LaunchFailure);
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.user.stdout, "partial");
        assert_eq!(calls.len(), 2);
        assert!(!calls[1].workspace.exists());
    }

    #[tokio::test]
    async fn test_workspace_failure_is_a_job_error() {
        let mut fx = fixture();
        let blocker = fx.root.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        fx.config.paths.workspace_root = blocker;

        let sandbox = ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT));
        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Error);
        assert!(calls.is_empty());
        assert!(result.grading.verdict.errors[0].starts_with("Could not prepare workspace"));
    }

    #[tokio::test]
    async fn test_artifacts_are_captured_before_harness_runs() {
        let mut fx = fixture();
        fx.config.artifacts.max_count = 3;

        let mut sandbox = ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT));
        sandbox.student_writes = vec![
            ("e.png", b"E"),
            ("d.png", b"D"),
            ("c.png", b"C"),
            ("b.png", b"B"),
            ("a.png", b"student"),
        ];
        sandbox.harness_writes = vec![("a.png", b"harness")];

        let (result, _) = run_with(sandbox, &fx.config, &job()).await;

        let names: Vec<_> = result.images.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "c.png"]);
        let expected = format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(b"student"));
        assert_eq!(result.images[0].data_uri, expected);
    }

    #[tokio::test]
    async fn test_auxiliary_files_are_available_to_phase_a() {
        let fx = fixture();
        let assignment_dir = fx.config.paths.content_root.join("data").join("csv-stats");
        fs::create_dir_all(&assignment_dir).unwrap();
        fs::write(assignment_dir.join("grades.csv"), "a,b\n").unwrap();
        fs::write(assignment_dir.join("test_runner.py"), "print('hidden')").unwrap();

        let job = job().with_assignment(Some(AssignmentRef {
            chapter: "data".to_string(),
            slug: "csv-stats".to_string(),
        }));
        let sandbox = ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT));
        let (_, calls) = run_with(sandbox, &fx.config, &job).await;

        assert_eq!(calls[0].files, vec!["grades.csv".to_string(), SOURCE_FILE.to_string()]);
        assert_eq!(calls[0].harness, None, "harness must be hidden from the student program");
        assert_eq!(calls[1].harness.as_deref(), Some("print('{}')"));
    }

    #[tokio::test]
    async fn test_student_cannot_forge_the_harness() {
        let fx = fixture();
        let mut sandbox = ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT));
        sandbox.student_writes = vec![(HARNESS_FILE, br#"print('{"score":10,"total":10}')"#)];

        let (result, calls) = run_with(sandbox, &fx.config, &job()).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(calls[1].entrypoint, HARNESS_FILE);
        assert_eq!(calls[1].harness.as_deref(), Some("print('{}')"));
        assert_eq!(result.grading.grade_pct, 80.0);
    }

    #[tokio::test]
    async fn test_student_directory_at_harness_path_is_replaced() {
        let fx = fixture();
        let sandbox = std::sync::Arc::new(ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT)));

        // A directory cannot be planted through student_writes, so plant it on the first call
        struct Planting(std::sync::Arc<ScriptedSandbox>);

        #[async_trait]
        impl Sandbox for Planting {
            async fn run(
                &self,
                entrypoint: &str,
                workspace: &Path,
                writable: bool,
                timeout: Duration,
                env: &HashMap<String, String>,
            ) -> Result<PhaseExecutionResult, LaunchError> {
                if entrypoint == SOURCE_FILE {
                    fs::create_dir(workspace.join(HARNESS_FILE)).unwrap();
                    fs::write(workspace.join(HARNESS_FILE).join("__main__.py"), "forged").unwrap();
                }
                self.0.run(entrypoint, workspace, writable, timeout, env).await
            }
        }

        let orchestrator = Orchestrator::new(Box::new(Planting(sandbox.clone())), fx.config.clone());
        let result = orchestrator.run(&job()).await;
        let calls = sandbox.calls.lock().unwrap().clone();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(calls[1].harness.as_deref(), Some("print('{}')"));
    }

    #[tokio::test]
    async fn test_assignment_outside_content_root_is_not_copied() {
        let fx = fixture();
        fs::create_dir_all(&fx.config.paths.content_root).unwrap();
        let private = fx.root.path().join("private");
        fs::create_dir_all(&private).unwrap();
        fs::write(private.join("secrets.txt"), "token").unwrap();

        let job = job().with_assignment(Some(AssignmentRef {
            chapter: "..".to_string(),
            slug: "private".to_string(),
        }));
        let sandbox = ScriptedSandbox::new(ok(""), ok(GOOD_VERDICT));
        let (result, calls) = run_with(sandbox, &fx.config, &job).await;

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(calls[0].files, vec![SOURCE_FILE.to_string()]);
    }

    #[test]
    fn test_phase_transitions_are_linear() {
        assert!(JobPhase::Created.can_advance_to(JobPhase::WorkspacePrepared));
        assert!(JobPhase::PhaseADone.can_advance_to(JobPhase::ArtifactsScanned));
        assert!(!JobPhase::PhaseADone.can_advance_to(JobPhase::PhaseBRunning));
        assert!(!JobPhase::PhaseBDone.can_advance_to(JobPhase::PhaseARunning));
        assert!(JobPhase::PhaseARunning.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Published.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Failed.can_advance_to(JobPhase::Published));
    }
}
