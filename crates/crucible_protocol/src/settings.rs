//! Worker settings file.
//!
//! Tuning knobs load from a YAML file (`crucible.yaml` by convention); a
//! missing or empty file yields defaults so a bare checkout runs. Endpoints
//! and credentials are deliberately NOT here — those come from the
//! environment at process start.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Resource and lifecycle caps for the sandboxed defense container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseJobSettings {
    /// Container memory cap in bytes.
    pub mem_limit_bytes: i64,
    /// Container CPU cap in units of 1e-9 CPUs.
    pub nano_cpus: i64,
    /// Container process-count cap.
    pub pids_limit: i64,
    /// Readiness deadline in seconds.
    pub container_timeout: u64,
    /// Uncompressed image size bound in MB.
    pub max_uncompressed_size_mb: u64,
    /// Size cap for each tmpfs mount (`/tmp`, `/run`, `/var/tmp`).
    pub tmpfs_size_mb: u64,
    /// Exit the evaluation loop after this many seconds of empty queue.
    /// Unset means poll forever and rely on external shutdown.
    pub idle_timeout_seconds: Option<u64>,
}

impl Default for DefenseJobSettings {
    fn default() -> Self {
        Self {
            mem_limit_bytes: 1024 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 100,
            container_timeout: 30,
            max_uncompressed_size_mb: 1024,
            tmpfs_size_mb: 64,
            idle_timeout_seconds: None,
        }
    }
}

/// Per-file evaluation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Per-file HTTP timeout in seconds.
    pub requests_timeout_seconds: u64,
    /// Blocking-pop timeout against the internal queue, in seconds.
    pub poll_timeout_seconds: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            requests_timeout_seconds: 5,
            poll_timeout_seconds: 1,
        }
    }
}

/// Bounds applied while resolving git/zip defense sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Compressed archive bound in MB.
    pub max_zip_size_mb: u64,
    /// Uncompressed extraction bound in MB.
    pub max_uncompressed_size_mb: u64,
    /// File-count cap for archives and build contexts.
    pub max_file_count: usize,
    /// Dockerfile size cap in KB.
    pub max_dockerfile_size_kb: u64,
    /// Wall-clock bound for image builds (and clones), in seconds.
    pub max_build_time_seconds: u64,
    /// Disable networking during builds.
    pub network_disabled: bool,
    /// Disable the build cache.
    pub no_cache: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            max_zip_size_mb: 512,
            max_uncompressed_size_mb: 10 * 1024,
            max_file_count: 10_000,
            max_dockerfile_size_kb: 100,
            max_build_time_seconds: 600,
            network_disabled: true,
            no_cache: true,
        }
    }
}

/// Root of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub defense_job: DefenseJobSettings,
    pub evaluation: EvaluationSettings,
    pub source: SourceSettings,
}

impl WorkerSettings {
    /// Load settings from a YAML file, falling back to defaults if the file
    /// is missing or unreadable. A malformed file is an error: silently
    /// running with default resource caps against a typo'd config is worse
    /// than refusing to start.
    pub fn load(path: &Path) -> Result<Self, serde_yaml::Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("settings file {} not readable ({e}), using defaults", path.display());
                return Ok(Self::default());
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_knobs() {
        let s = WorkerSettings::default();
        assert_eq!(s.defense_job.mem_limit_bytes, 1 << 30);
        assert_eq!(s.defense_job.container_timeout, 30);
        assert_eq!(s.evaluation.requests_timeout_seconds, 5);
        assert_eq!(s.source.max_zip_size_mb, 512);
        assert!(s.source.network_disabled);
        assert!(s.defense_job.idle_timeout_seconds.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let s = WorkerSettings::load(Path::new("/nonexistent/crucible.yaml")).unwrap();
        assert_eq!(s.evaluation.poll_timeout_seconds, 1);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "defense_job:\n  pids_limit: 25\nevaluation:\n  requests_timeout_seconds: 9").unwrap();
        let s = WorkerSettings::load(f.path()).unwrap();
        assert_eq!(s.defense_job.pids_limit, 25);
        assert_eq!(s.evaluation.requests_timeout_seconds, 9);
        // untouched keys keep defaults
        assert_eq!(s.defense_job.nano_cpus, 1_000_000_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "defense_job: [not, a, map]").unwrap();
        assert!(WorkerSettings::load(f.path()).is_err());
    }
}
