//! Submission operations: creation, validation outcomes, validated sets.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::types::{DefenseSource, Submission, SubmissionKind, SubmissionStatus};
use crate::CrucibleDb;

impl CrucibleDb {
    /// Insert a defense submission with the given source, `status =
    /// submitted`, functional state unknown.
    pub async fn create_defense(&self, source: &DefenseSource) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO submissions (id, kind, status, source, created_at, updated_at)
            VALUES (?, 'defense', 'submitted', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(serde_json::to_string(source)?)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Insert an attack submission with `status = submitted`.
    pub async fn create_attack(&self) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO submissions (id, kind, status, created_at, updated_at)
            VALUES (?, 'attack', 'submitted', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn get_submission(&self, id: &str) -> Result<Option<Submission>> {
        let row = sqlx::query("SELECT * FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(submission_from_row).transpose()
    }

    /// The defense's provenance, or NotFound.
    pub async fn defense_source(&self, id: &str) -> Result<DefenseSource> {
        let sub = self
            .get_submission(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("submission {id}")))?;
        sub.source
            .ok_or_else(|| DbError::corrupt_row(format!("defense {id} has no source")))
    }

    /// Record the outcome of functional validation. Success makes the
    /// defense validated; failure retires it with the probe's complaint.
    pub async fn set_defense_functional(
        &self,
        id: &str,
        functional: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if functional { SubmissionStatus::Ready } else { SubmissionStatus::Failed };
        let affected = sqlx::query(
            r#"
            UPDATE submissions
            SET is_functional = ?, status = ?, functional_error = ?, updated_at = ?
            WHERE id = ? AND kind = 'defense'
            "#,
        )
        .bind(functional)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::not_found(format!("defense submission {id}")));
        }
        info!(submission_id = %id, functional, "Defense validation recorded");
        Ok(())
    }

    /// Mark an attack validated.
    pub async fn mark_attack_ready(&self, id: &str) -> Result<()> {
        self.set_attack_status(id, SubmissionStatus::Ready, None).await
    }

    /// Retire an attack that failed validation.
    pub async fn mark_attack_failed(&self, id: &str, error: &str) -> Result<()> {
        self.set_attack_status(id, SubmissionStatus::Failed, Some(error)).await
    }

    async fn set_attack_status(
        &self,
        id: &str,
        status: SubmissionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE submissions
            SET status = ?, functional_error = ?, updated_at = ?
            WHERE id = ? AND kind = 'attack'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::not_found(format!("attack submission {id}")));
        }
        Ok(())
    }

    /// All validated, non-deleted defenses.
    pub async fn validated_defenses(&self) -> Result<Vec<Submission>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM submissions
            WHERE kind = 'defense' AND status = 'ready' AND is_functional = 1
              AND deleted_at IS NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(submission_from_row).collect()
    }

    /// Soft-delete: the submission stops participating in dispatch but its
    /// rows remain for history.
    pub async fn soft_delete_submission(&self, id: &str) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE submissions SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("submission {id}")));
        }
        Ok(())
    }
}

pub(crate) fn submission_from_row(row: &SqliteRow) -> Result<Submission> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let source: Option<String> = row.try_get("source")?;
    Ok(Submission {
        id: row.try_get("id")?,
        kind: SubmissionKind::parse(&kind)
            .ok_or_else(|| DbError::corrupt_row(format!("submission kind '{kind}'")))?,
        status: SubmissionStatus::parse(&status)
            .ok_or_else(|| DbError::corrupt_row(format!("submission status '{status}'")))?,
        is_functional: row.try_get("is_functional")?,
        functional_error: row.try_get("functional_error")?,
        source: source.as_deref().map(serde_json::from_str).transpose()?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
