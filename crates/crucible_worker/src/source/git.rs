//! Bounded shallow clones of git-sourced defenses.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use crucible_protocol::SourceSettings;

use super::SourceError;

/// `git clone --depth 1 --single-branch` into `dest`, bounded by the build
/// wall-clock setting. Prompting is disabled — a repo that wants
/// credentials fails instead of hanging.
pub async fn clone_shallow(
    url: &str,
    dest: &Path,
    settings: &SourceSettings,
) -> Result<(), SourceError> {
    info!(url, "Cloning defense repository (shallow)");

    let clone = Command::new("git")
        .args(["clone", "--depth", "1", "--single-branch", url])
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output =
        match tokio::time::timeout(Duration::from_secs(settings.max_build_time_seconds), clone)
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(SourceError::Clone(format!(
                    "timed out after {}s",
                    settings.max_build_time_seconds
                )))
            }
        };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Clone(stderr.trim().to_string()));
    }
    Ok(())
}
