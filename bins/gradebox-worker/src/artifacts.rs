/// Artifact Collector - picks generated images out of a workspace after Phase A
///
/// Best effort and infallible: anything that cannot be read, is too large,
/// or is not a regular file is left out. Files are visited in lexicographic
/// order and collection stops once the count cap is reached.
use crate::config::ArtifactConfig;
use crate::workspace::has_extension;
use base64::{engine::general_purpose, Engine as _};
use gradebox_common::types::Artifact;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

fn mime_type(extension: &str) -> String {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png".to_string(),
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "svg" => "image/svg+xml".to_string(),
        "gif" => "image/gif".to_string(),
        other => format!("image/{}", other),
    }
}

pub fn collect(workspace: &Path, config: &ArtifactConfig) -> Vec<Artifact> {
    let mut entries: Vec<_> = match fs::read_dir(workspace) {
        Ok(entries) => entries.flatten().collect(),
        Err(e) => {
            warn!(path = %workspace.display(), error = %e, "Could not scan workspace for artifacts");
            return Vec::new();
        }
    };
    entries.sort_by_key(|entry| entry.file_name());

    let mut artifacts = Vec::new();

    for entry in entries {
        let path = entry.path();
        if !has_extension(&path, &config.extensions) {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();

        if artifacts.len() >= config.max_count {
            debug!(file = %name, max = config.max_count, "Artifact count cap reached");
            break;
        }

        // symlink_metadata so a link planted by student code is never followed
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => {
                if meta.len() > config.max_bytes {
                    debug!(file = %name, size = meta.len(), "Skipping oversized artifact");
                    continue;
                }
            }
            Ok(_) => {
                debug!(file = %name, "Skipping non-regular file");
                continue;
            }
            Err(e) => {
                debug!(file = %name, error = %e, "Could not stat artifact");
                continue;
            }
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                debug!(file = %name, error = %e, "Could not read artifact");
                continue;
            }
        };

        // The file may have grown between stat and read
        if data.len() as u64 > config.max_bytes {
            debug!(file = %name, size = data.len(), "Skipping oversized artifact");
            continue;
        }

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let mime_type = mime_type(extension);
        let data_uri = format!(
            "data:{};base64,{}",
            mime_type,
            general_purpose::STANDARD.encode(&data)
        );

        debug!(file = %name, size = data.len(), "Captured artifact");
        artifacts.push(Artifact {
            name,
            size_bytes: data.len() as u64,
            mime_type,
            data_uri,
        });
    }

    artifacts
}
