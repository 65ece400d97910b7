//! Job store operations.
//!
//! Jobs move `queued -> running -> done|failed` and nothing else; a terminal
//! row is never touched again. The transition runs inside a transaction with
//! a status-guarded UPDATE so racing workers cannot both claim the edge.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::types::{Job, JobKind, JobStatus};
use crate::CrucibleDb;

impl CrucibleDb {
    /// Insert a new job with `status = queued` and return its id.
    pub async fn create_job(
        &self,
        kind: JobKind,
        payload: &serde_json::Value,
        requested_by: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, status, payload, requested_by, created_at, updated_at)
            VALUES (?, ?, 'queued', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(requested_by)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        info!(job_id = %id, kind = kind.as_str(), "Job created");
        Ok(id)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Apply a status transition, rejecting any edge other than
    /// `queued -> running` and `running -> done|failed`.
    ///
    /// `error` is persisted only with `failed`; passing it with any other
    /// status is rejected as a caller bug.
    pub async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if error.is_some() && status != JobStatus::Failed {
            return Err(DbError::invalid_transition(format!(
                "job {id}: error string only accompanies 'failed', got '{status}'"
            )));
        }

        let mut tx = self.pool().begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| DbError::not_found(format!("job {id}")))?;
        let current = JobStatus::parse(&current)
            .ok_or_else(|| DbError::corrupt_row(format!("job {id} status '{current}'")))?;

        if !current.can_transition_to(status) {
            return Err(DbError::invalid_transition(format!(
                "job {id}: {current} -> {status}"
            )));
        }

        // Guarded update: if another worker won the edge between our read
        // and here, zero rows change and the claim fails.
        let affected = sqlx::query(
            "UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .bind(current.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::invalid_transition(format!(
                "job {id}: lost race for {current} -> {status}"
            )));
        }

        tx.commit().await?;
        info!(job_id = %id, status = %status, "Job transitioned");
        Ok(())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| DbError::corrupt_row(format!("job kind '{kind}'")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| DbError::corrupt_row(format!("job status '{status}'")))?,
        payload: serde_json::from_str(&payload)?,
        requested_by: row.try_get("requested_by")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
