// Worker configuration for gradebox
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/grader.json";

/// Container invocation and resource limits applied to every phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    /// Arguments placed before the entrypoint file name
    pub command_prefix: Vec<String>,
    pub memory_limit_mb: u32,
    pub pids_limit: i64,
    pub cpu_limit: Option<f32>,
    pub tmpfs_options: String,
    /// In-sandbox mount point of the workspace
    pub workdir: String,
    pub env: HashMap<String, String>,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert("MPLBACKEND".to_string(), "Agg".to_string());

        Self {
            image: "python-course-platform-sandbox:3.12".to_string(),
            command_prefix: vec!["run".to_string(), "python".to_string()],
            memory_limit_mb: 256,
            pids_limit: 128,
            cpu_limit: None,
            tmpfs_options: "rw,nosuid,nodev,noexec,size=64m".to_string(),
            workdir: "/work".to_string(),
            env,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub student_secs: u64,
    pub harness_secs: u64,
    pub soft_limit_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            student_secs: 10,
            harness_secs: 10,
            soft_limit_grace_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn student(&self) -> Duration {
        Duration::from_secs(self.student_secs)
    }

    pub fn harness(&self) -> Duration {
        Duration::from_secs(self.harness_secs)
    }

    /// Backstop for the whole job, slightly above both phases combined
    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.student_secs + self.harness_secs + self.soft_limit_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub max_count: usize,
    pub max_bytes: u64,
    pub extensions: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            max_count: 3,
            max_bytes: 2 * 1024 * 1024,
            extensions: ["png", "jpg", "jpeg", "svg"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Where workspaces are created, as seen by the worker
    pub workspace_root: PathBuf,
    /// The same directory as seen by the container runtime daemon
    pub bind_root: PathBuf,
    /// Checked-out course content (`<chapter>/<assignment>/...`)
    pub content_root: PathBuf,
    pub auxiliary_extensions: Vec<String>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/grader"),
            bind_root: PathBuf::from("/var/tmp/grader"),
            content_root: PathBuf::from("/app/python_course_repo"),
            auxiliary_extensions: vec!["csv".to_string(), "txt".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub sandbox: SandboxConfig,
    pub timeouts: TimeoutConfig,
    pub artifacts: ArtifactConfig,
    pub paths: PathConfig,
    /// Re-queue attempts for jobs that failed on infrastructure
    pub max_retries: u32,
}

impl WorkerConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `GRADEBOX_CONFIG` (or config/grader.json), then apply environment overrides.
    /// A missing file falls back to built-in defaults.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("GRADEBOX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("GRADER_HOST_DIR") {
            self.paths.workspace_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("GRADER_BIND_DIR") {
            self.paths.bind_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LOCAL_PATH") {
            self.paths.content_root = PathBuf::from(dir);
        }
        if let Some(image) = lookup("SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
    }
}
