//! Attack files, evaluation runs and per-file results.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::types::{AttackFile, EvaluationResult, EvaluationRun, RunStatus};
use crate::CrucibleDb;

impl CrucibleDb {
    /// Register one file of an attack. Immutable once written.
    pub async fn add_attack_file(
        &self,
        attack_submission_id: &str,
        object_key: &str,
        filename: &str,
        sha256: &str,
        is_malware: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO attack_files (id, attack_submission_id, object_key, filename, sha256, is_malware, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(attack_submission_id)
        .bind(object_key)
        .bind(filename)
        .bind(sha256)
        .bind(is_malware)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    /// Files of an attack in creation order. Result rows are appended in
    /// exactly this order.
    pub async fn attack_files(&self, attack_submission_id: &str) -> Result<Vec<AttackFile>> {
        let rows = sqlx::query(
            "SELECT * FROM attack_files WHERE attack_submission_id = ? ORDER BY created_at, rowid",
        )
        .bind(attack_submission_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(attack_file_from_row).collect()
    }

    pub async fn count_attack_files(&self, attack_submission_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM attack_files WHERE attack_submission_id = ?")
                .bind(attack_submission_id)
                .fetch_one(self.pool())
                .await?,
        )
    }

    /// Validated, non-deleted attacks this defense has not been run against:
    /// no evaluation run for the pair is queued, running or done. Failed
    /// runs do not count — their attacks come back for another pass.
    pub async fn unevaluated_attacks_for(&self, defense_submission_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.id FROM submissions s
            WHERE s.kind = 'attack' AND s.status = 'ready' AND s.deleted_at IS NULL
              AND NOT EXISTS (
                SELECT 1 FROM evaluation_runs r
                WHERE r.defense_submission_id = ?
                  AND r.attack_submission_id = s.id
                  AND r.status IN ('queued', 'running', 'done')
              )
            ORDER BY s.created_at
            "#,
        )
        .bind(defense_submission_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    /// Whether a run for this pair is currently non-terminal.
    pub async fn active_run_exists(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM evaluation_runs
            WHERE defense_submission_id = ? AND attack_submission_id = ?
              AND status IN ('queued', 'running')
            "#,
        )
        .bind(defense_submission_id)
        .bind(attack_submission_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    /// Whether the pair already has a run that finished successfully.
    pub async fn completed_run_exists(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM evaluation_runs
            WHERE defense_submission_id = ? AND attack_submission_id = ?
              AND status = 'done'
            "#,
        )
        .bind(defense_submission_id)
        .bind(attack_submission_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    /// Return the pair's non-terminal run, creating one in `running` if none
    /// exists. An existing `queued` run is promoted to `running`.
    pub async fn ensure_run(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
    ) -> Result<EvaluationRun> {
        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT * FROM evaluation_runs
            WHERE defense_submission_id = ? AND attack_submission_id = ?
              AND status IN ('queued', 'running')
            LIMIT 1
            "#,
        )
        .bind(defense_submission_id)
        .bind(attack_submission_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let mut run = run_from_row(&row)?;
            if run.status == RunStatus::Queued {
                sqlx::query("UPDATE evaluation_runs SET status = 'running', updated_at = ? WHERE id = ?")
                    .bind(Utc::now())
                    .bind(&run.id)
                    .execute(&mut *tx)
                    .await?;
                run.status = RunStatus::Running;
            }
            tx.commit().await?;
            return Ok(run);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO evaluation_runs (id, defense_submission_id, attack_submission_id, status, created_at, updated_at)
            VALUES (?, ?, ?, 'running', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(defense_submission_id)
        .bind(attack_submission_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(run_id = %id, defense = %defense_submission_id, attack = %attack_submission_id,
              "Evaluation run created");
        Ok(EvaluationRun {
            id,
            defense_submission_id: defense_submission_id.to_string(),
            attack_submission_id: attack_submission_id.to_string(),
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn complete_run(&self, run_id: &str) -> Result<()> {
        self.set_run_status(run_id, RunStatus::Done).await
    }

    pub async fn fail_run(&self, run_id: &str) -> Result<()> {
        self.set_run_status(run_id, RunStatus::Failed).await
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE evaluation_runs SET status = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(run_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(DbError::invalid_transition(format!(
                "run {run_id}: no non-terminal run to move to {status}"
            )));
        }
        Ok(())
    }

    pub async fn runs_for_pair(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
    ) -> Result<Vec<EvaluationRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM evaluation_runs
            WHERE defense_submission_id = ? AND attack_submission_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(defense_submission_id)
        .bind(attack_submission_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    /// Append one per-file outcome. `model_output` is NULL exactly when
    /// `error` explains the miss.
    pub async fn insert_result(
        &self,
        evaluation_run_id: &str,
        attack_file_id: &str,
        model_output: Option<i64>,
        error: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        debug_assert_eq!(model_output.is_none(), error.is_some());
        sqlx::query(
            r#"
            INSERT INTO evaluation_results (evaluation_run_id, attack_file_id, model_output, error, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(evaluation_run_id)
        .bind(attack_file_id)
        .bind(model_output)
        .bind(error)
        .bind(duration_ms)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Results in insertion order (which the loop keeps equal to the
    /// attack's file-creation order).
    pub async fn results_for_run(&self, evaluation_run_id: &str) -> Result<Vec<EvaluationResult>> {
        let rows = sqlx::query(
            "SELECT * FROM evaluation_results WHERE evaluation_run_id = ? ORDER BY id",
        )
        .bind(evaluation_run_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    pub async fn count_results(&self, evaluation_run_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM evaluation_results WHERE evaluation_run_id = ?",
        )
        .bind(evaluation_run_id)
        .fetch_one(self.pool())
        .await?)
    }
}

fn attack_file_from_row(row: &SqliteRow) -> Result<AttackFile> {
    Ok(AttackFile {
        id: row.try_get("id")?,
        attack_submission_id: row.try_get("attack_submission_id")?,
        object_key: row.try_get("object_key")?,
        filename: row.try_get("filename")?,
        sha256: row.try_get("sha256")?,
        is_malware: row.try_get("is_malware")?,
        created_at: row.try_get("created_at")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<EvaluationRun> {
    let status: String = row.try_get("status")?;
    Ok(EvaluationRun {
        id: row.try_get("id")?,
        defense_submission_id: row.try_get("defense_submission_id")?,
        attack_submission_id: row.try_get("attack_submission_id")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| DbError::corrupt_row(format!("run status '{status}'")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<EvaluationResult> {
    Ok(EvaluationResult {
        id: row.try_get("id")?,
        evaluation_run_id: row.try_get("evaluation_run_id")?,
        attack_file_id: row.try_get("attack_file_id")?,
        model_output: row.try_get("model_output")?,
        error: row.try_get("error")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}
