/// Sandbox Launcher - one isolated, resource-bounded run of a program file
///
/// **Core Responsibility:**
/// Run `<command_prefix> <entrypoint>` against a prepared workspace and
/// return its exit code, captured output and duration.
///
/// **Architectural Boundary:**
/// - Knows HOW to isolate (container runtime, limits, mounts)
/// - Knows nothing about grading, phases or artifacts
/// - A timeout is a normal outcome; only a failure to launch is an error
///
/// Isolation itself is delegated to Docker. Every container gets:
/// - no network
/// - fixed memory and pids ceilings
/// - a size-capped noexec/nosuid/nodev tmpfs on /tmp
/// - the workspace bind-mounted at the workdir, read-only unless `writable`
/// - all capabilities dropped and no-new-privileges
use crate::config::{SandboxConfig, WorkerConfig};
use crate::workspace::to_host_path;
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gradebox_common::types::PhaseExecutionResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The sandbox could not be launched at all (runtime unavailable, image missing, ...)
    #[error("sandbox infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `entrypoint` (a file name inside `workspace`) to completion or until `timeout`
    async fn run(
        &self,
        entrypoint: &str,
        workspace: &Path,
        writable: bool,
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> Result<PhaseExecutionResult, LaunchError>;
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if the run is cancelled mid-flight
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot be async; removal runs on the runtime in the background
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// Bounded capture of one output stream
struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Entry points are plain file names inside the workspace
fn validate_entrypoint(entrypoint: &str) -> Result<(), LaunchError> {
    let valid = !entrypoint.is_empty()
        && !entrypoint.contains('/')
        && !entrypoint.contains('\\')
        && entrypoint != "."
        && entrypoint != "..";
    if valid {
        Ok(())
    } else {
        Err(LaunchError::InvalidRequest(format!(
            "entrypoint must be a file name inside the workspace, got {:?}",
            entrypoint
        )))
    }
}

/// Build the container definition for one phase
fn container_config(
    sandbox: &SandboxConfig,
    entrypoint: &str,
    host_workspace: &Path,
    writable: bool,
    env: &HashMap<String, String>,
) -> Config<String> {
    let mount_mode = if writable { "rw" } else { "ro" };
    let bind = format!("{}:{}:{}", host_workspace.display(), sandbox.workdir, mount_mode);

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), sandbox.tmpfs_options.clone());

    // Request env overrides configured defaults; sorted for a stable invocation
    let mut merged = sandbox.env.clone();
    merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let mut env_list: Vec<String> = merged.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    env_list.sort();

    let mut cmd = sandbox.command_prefix.clone();
    cmd.push(entrypoint.to_string());

    let memory = (sandbox.memory_limit_mb as i64) * 1024 * 1024;

    Config {
        image: Some(sandbox.image.clone()),
        cmd: Some(cmd),
        env: Some(env_list),
        working_dir: Some(sandbox.workdir.clone()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            memory: Some(memory),
            memory_swap: Some(memory),
            pids_limit: Some(sandbox.pids_limit),
            nano_cpus: sandbox.cpu_limit.map(|cpus| (cpus as f64 * 1_000_000_000.0) as i64),
            network_mode: Some("none".to_string()),
            binds: Some(vec![bind]),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Docker-backed sandbox used in production
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    workspace_root: PathBuf,
    bind_root: PathBuf,
}

impl DockerSandbox {
    pub fn new(config: &WorkerConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            config: config.sandbox.clone(),
            workspace_root: config.paths.workspace_root.clone(),
            bind_root: config.paths.bind_root.clone(),
        })
    }

    /// Ensure the sandbox image is available (pull if needed)
    async fn ensure_image(&self) -> Result<(), LaunchError> {
        let image = self.config.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                LaunchError::Infrastructure(format!("Failed to pull image '{}': {}", image, e))
            })?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[tracing::instrument(skip(self, workspace, env), fields(writable = writable, timeout_ms = timeout.as_millis() as u64))]
    async fn run(
        &self,
        entrypoint: &str,
        workspace: &Path,
        writable: bool,
        timeout: Duration,
        env: &HashMap<String, String>,
    ) -> Result<PhaseExecutionResult, LaunchError> {
        validate_entrypoint(entrypoint)?;

        let host_workspace = to_host_path(workspace, &self.workspace_root, &self.bind_root);
        debug!(host_workspace = %host_workspace.display(), "Mounting workspace");

        self.ensure_image().await?;

        let container_name = format!("gradebox-{}", uuid::Uuid::new_v4());
        let config = container_config(&self.config, entrypoint, &host_workspace, writable, env);
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| LaunchError::Infrastructure(format!("Failed to create container: {}", e)))?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| LaunchError::Infrastructure(format!("Failed to start container: {}", e)))?;

        let limit = self.config.max_output_bytes;
        let execution_future = async {
            let mut stdout = OutputBuffer::new(limit);
            let mut stderr = OutputBuffer::new(limit);

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });

            let mut logs_stream = self.docker.logs(&container_id, logs_options);
            while let Some(output) = logs_stream.next().await {
                match output {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to wait for container");
                    None
                }
                None => None,
            };

            (stdout.into_string(), stderr.into_string(), exit_code)
        };

        match tokio::time::timeout(timeout, execution_future).await {
            Ok((stdout, mut stderr, Some(exit_code))) => {
                let duration_ms = start_time.elapsed().as_millis() as u64;
                if exit_code == 137 {
                    stderr.push_str("\n[Container killed: likely exceeded memory limit]");
                } else if exit_code == 139 {
                    stderr.push_str("\n[Container killed: segmentation fault]");
                }
                debug!(exit_code, duration_ms, "Container exited");

                Ok(PhaseExecutionResult {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    timed_out: false,
                })
            }
            Ok((_, _, None)) => Err(LaunchError::Infrastructure(
                "Container finished without reporting an exit status".to_string(),
            )),
            Err(_) => {
                let duration_ms = start_time.elapsed().as_millis() as u64;
                warn!(duration_ms, "Execution timed out, killing container");

                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }

                Ok(PhaseExecutionResult::timed_out(
                    format!(
                        "Timed out after {}s while running {}.",
                        timeout.as_secs(),
                        entrypoint
                    ),
                    duration_ms,
                ))
            }
        }
    }
}
