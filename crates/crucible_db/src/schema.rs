//! Schema creation. All CREATE TABLE statements live here.

use crate::error::Result;
use crate::CrucibleDb;
use tracing::info;

impl CrucibleDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(self.pool())
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(self.pool())
            .await?;

        // Jobs: the durable record of broker work. `error` is set only on
        // failure; `payload` is written once at creation and never rewritten.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                payload TEXT NOT NULL DEFAULT '{}',
                requested_by TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Submissions: defenses and attacks. `source` is the JSON-tagged
        // provenance of a defense; NULL for attacks. `is_functional` is NULL
        // until the defense has been probed.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'submitted',
                is_functional INTEGER,
                functional_error TEXT,
                source TEXT,
                deleted_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Attack files: immutable once written, ordered by creation within
        // an attack.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS attack_files (
                id TEXT PRIMARY KEY,
                attack_submission_id TEXT NOT NULL REFERENCES submissions(id),
                object_key TEXT NOT NULL,
                filename TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                is_malware INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_attack_files_submission
             ON attack_files(attack_submission_id, created_at)",
        )
        .execute(self.pool())
        .await?;

        // Evaluation runs: one per claimed (defense, attack) pair.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS evaluation_runs (
                id TEXT PRIMARY KEY,
                defense_submission_id TEXT NOT NULL REFERENCES submissions(id),
                attack_submission_id TEXT NOT NULL REFERENCES submissions(id),
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_evaluation_runs_pair
             ON evaluation_runs(defense_submission_id, attack_submission_id)",
        )
        .execute(self.pool())
        .await?;

        // Per-file results. `model_output` NULL iff `error` is set.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS evaluation_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                evaluation_run_id TEXT NOT NULL REFERENCES evaluation_runs(id),
                attack_file_id TEXT NOT NULL REFERENCES attack_files(id),
                model_output INTEGER,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_evaluation_results_run
             ON evaluation_results(evaluation_run_id)",
        )
        .execute(self.pool())
        .await?;

        info!("Database schema verified");
        Ok(())
    }
}
