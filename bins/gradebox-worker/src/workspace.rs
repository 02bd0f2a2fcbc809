/// Per-job workspace
///
/// Each job owns exactly one directory under the configured workspace root.
/// The directory is removed when the workspace is closed, or when it is
/// dropped on any other exit path (panic, soft-limit cancellation).
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

pub const SOURCE_FILE: &str = "user_submission.py";
pub const HARNESS_FILE: &str = "test_runner.py";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {root}: {source}")]
    Create {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {name} into workspace: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh, exclusively owned directory `sub_<id>_XXXX` under `root`
    pub fn create(root: &Path, submission_id: &str) -> Result<Self, WorkspaceError> {
        let create_error = |source| WorkspaceError::Create {
            root: root.to_path_buf(),
            source,
        };

        fs::create_dir_all(root).map_err(create_error)?;

        let prefix = format!("sub_{}_", sanitize(submission_id));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(root)
            .map_err(create_error)?;

        debug!(path = %dir.path().display(), "Workspace created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, name: &str, content: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.path().join(name);
        fs::write(&path, content).map_err(|source| WorkspaceError::Write {
            name: name.to_string(),
            source,
        })?;
        Ok(path)
    }

    /// Write `name` after removing whatever the sandboxed program left there.
    /// A planted symlink or directory is removed, never followed.
    pub fn replace_file(&self, name: &str, content: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.path().join(name);
        let write_error = |source| WorkspaceError::Write {
            name: name.to_string(),
            source,
        };

        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).map_err(write_error)?,
            Ok(_) => fs::remove_file(&path).map_err(write_error)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_error(e)),
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(write_error)?;
        file.write_all(content.as_bytes()).map_err(write_error)?;
        Ok(path)
    }

    /// Copy eligible input files from `source_dir` and mark them read-only.
    /// Faults are logged and skipped; returns the number of files copied.
    pub fn copy_auxiliary(&self, source_dir: &Path, extensions: &[String]) -> usize {
        let entries = match fs::read_dir(source_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %source_dir.display(), error = %e, "No auxiliary files");
                return 0;
            }
        };

        let mut copied = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !has_extension(&path, extensions) {
                continue;
            }
            let name = entry.file_name();
            let target = self.path().join(&name);

            let result = fs::copy(&path, &target).and_then(|_| {
                let mut perms = fs::metadata(&target)?.permissions();
                perms.set_readonly(true);
                fs::set_permissions(&target, perms)
            });

            match result {
                Ok(()) => {
                    debug!(file = %name.to_string_lossy(), "Copied auxiliary file");
                    copied += 1;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Could not copy auxiliary file");
                }
            }
        }
        copied
    }

    /// Remove the workspace. Consumes it so removal happens at most once;
    /// a removal fault is logged and otherwise ignored.
    pub fn close(self) {
        let path = self.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Workspace removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Workspace removal failed"),
        }
    }
}

/// Translate a worker-visible path under `workspace_root` into the path the
/// container runtime sees under `bind_root`. Other paths pass through.
pub fn to_host_path(path: &Path, workspace_root: &Path, bind_root: &Path) -> PathBuf {
    match path.strip_prefix(workspace_root) {
        Ok(relative) => bind_root.join(relative),
        Err(_) => {
            debug!(path = %path.display(), "Path outside workspace root; passing through");
            path.to_path_buf()
        }
    }
}

pub(crate) fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
