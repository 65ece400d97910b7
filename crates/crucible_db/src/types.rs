//! Entities persisted by the store.
//!
//! These types are the single source of truth for every component; the
//! worker, dispatcher and tests all speak in terms of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enums
// ============================================================================

/// What a job does when a worker claims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Defense,
    Attack,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defense => "defense",
            Self::Attack => "attack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defense" => Some(Self::Defense),
            "attack" => Some(Self::Attack),
            _ => None,
        }
    }
}

/// Job lifecycle. `Done` and `Failed` are terminal; a terminal job is never
/// mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Permitted edges: `queued -> running`, `running -> done|failed`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    Defense,
    Attack,
}

impl SubmissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defense => "defense",
            Self::Attack => "attack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defense" => Some(Self::Defense),
            "attack" => Some(Self::Attack),
            _ => None,
        }
    }
}

/// Submission lifecycle. A defense is *validated* once `is_functional` is
/// true and status is `Ready`; an attack is validated on `Ready` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Submitted,
    Ready,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Evaluation-run lifecycle. Mirrors the job edges; at most one run per
/// (defense, attack) pair may sit in a non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Defense sources
// ============================================================================

/// Provenance of a defense image. Exactly one variant per defense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DefenseSource {
    /// A registry reference (or hub.docker.com URL) to pull.
    DockerImage { reference: String },
    /// A repository to shallow-clone and build.
    GitRepo { url: String },
    /// A blob-store key naming an uploaded zip to extract and build.
    ZipArchive { object_key: String },
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub requested_by: Option<String>,
    /// Populated only when `status == Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub kind: SubmissionKind,
    pub status: SubmissionStatus,
    /// `None` = unknown (defense not yet probed). Attacks never set this.
    pub is_functional: Option<bool>,
    pub functional_error: Option<String>,
    /// Defense provenance; `None` for attacks.
    pub source: Option<DefenseSource>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    /// Whether this submission participates in evaluation pairing.
    pub fn is_validated(&self) -> bool {
        match self.kind {
            SubmissionKind::Defense => {
                self.is_functional == Some(true) && self.status == SubmissionStatus::Ready
            }
            SubmissionKind::Attack => self.status == SubmissionStatus::Ready,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttackFile {
    pub id: String,
    pub attack_submission_id: String,
    pub object_key: String,
    pub filename: String,
    pub sha256: String,
    /// Ground-truth label supplied at upload time.
    pub is_malware: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EvaluationRun {
    pub id: String,
    pub defense_submission_id: String,
    pub attack_submission_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub id: i64,
    pub evaluation_run_id: String,
    pub attack_file_id: String,
    /// `Some(0|1)` on success, `None` when `error` explains the miss.
    pub model_output: Option<i64>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}
