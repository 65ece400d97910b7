//! Build-context hardening, shared by git and zip sources.

use std::path::Path;
use walkdir::WalkDir;

use crucible_protocol::SourceSettings;

use super::SourceError;

/// Reject contexts that are oversized, overcrowded, or missing their
/// Dockerfile. Runs before anything is handed to the builder.
pub fn validate_build_context(root: &Path, settings: &SourceSettings) -> Result<(), SourceError> {
    let dockerfile = root.join("Dockerfile");
    if !dockerfile.is_file() {
        return Err(SourceError::Rejected(
            "no Dockerfile at the root of the build context".to_string(),
        ));
    }

    let max_dockerfile_bytes = settings.max_dockerfile_size_kb * 1024;
    let dockerfile_bytes = dockerfile.metadata()?.len();
    if dockerfile_bytes > max_dockerfile_bytes {
        return Err(SourceError::Rejected(format!(
            "Dockerfile is {dockerfile_bytes} bytes (max: {max_dockerfile_bytes})"
        )));
    }
    if std::fs::read_to_string(&dockerfile).is_err() {
        return Err(SourceError::Rejected("Dockerfile is not valid UTF-8".to_string()));
    }

    let max_total_bytes = settings.max_uncompressed_size_mb * 1024 * 1024;
    let mut file_count = 0usize;
    let mut total_bytes = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SourceError::Rejected(format!("unreadable context: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        file_count += 1;
        total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);

        if file_count > settings.max_file_count {
            return Err(SourceError::Rejected(format!(
                "build context has more than {} files",
                settings.max_file_count
            )));
        }
        if total_bytes > max_total_bytes {
            return Err(SourceError::Rejected(format!(
                "build context exceeds {} MB uncompressed",
                settings.max_uncompressed_size_mb
            )));
        }
    }

    Ok(())
}
