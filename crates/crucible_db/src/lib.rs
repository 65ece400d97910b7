//! Relational store for the Crucible pipeline.
//!
//! Holds the durable record: jobs, submissions, attack files, evaluation
//! runs and per-file results. The work queue itself lives in the registry —
//! rows here exist for durability and observability, never for dispatch.
//!
//! # Example
//!
//! ```rust,ignore
//! use crucible_db::CrucibleDb;
//!
//! let db = CrucibleDb::open("crucible.db").await?;
//! let job_id = db.create_job(JobKind::Defense, &payload, Some("api")).await?;
//! ```

pub mod error;
mod evaluations;
mod jobs;
mod schema;
mod submissions;
pub mod types;

pub use error::{DbError, Result};
pub use types::{
    AttackFile, DefenseSource, EvaluationResult, EvaluationRun, Job, JobKind, JobStatus,
    RunStatus, Submission, SubmissionKind, SubmissionStatus,
};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Handle to the store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct CrucibleDb {
    pool: SqlitePool,
}

impl CrucibleDb {
    /// Open (creating if necessary) the store at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// In-memory store for tests. Single connection — a second connection
    /// would see a different empty database.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
