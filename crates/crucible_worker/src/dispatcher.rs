//! Attack dispatcher: the logic behind an attack-job envelope.
//!
//! Validates the attack, then routes it to every validated defense: onto a
//! live worker's internal queue when one is OPEN, otherwise via a fresh
//! defense-job. The claim key — not worker identity — guarantees that two
//! dispatchers racing on the same (defense, attack) pair enqueue it once.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crucible_db::{CrucibleDb, JobKind, JobStatus};
use crucible_protocol::TaskEnvelope;
use crucible_registry::{Registry, TaskBroker};

pub struct AttackDispatcher {
    db: CrucibleDb,
    registry: Arc<dyn Registry>,
    broker: Arc<dyn TaskBroker>,
}

impl AttackDispatcher {
    pub fn new(db: CrucibleDb, registry: Arc<dyn Registry>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { db, registry, broker }
    }

    /// Handle one attack-job envelope end to end.
    pub async fn run(&self, job_id: &str, attack_id: &str) -> Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            warn!(job_id, "Attack envelope names an unknown job; dropping");
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            info!(job_id, status = %job.status, "Redelivered attack envelope is a no-op");
            return Ok(());
        }
        self.db.set_job_status(job_id, JobStatus::Running, None).await?;

        let outcome = self.dispatch(job_id, attack_id).await;
        match outcome {
            Ok(()) => {
                self.db.set_job_status(job_id, JobStatus::Done, None).await?;
                info!(job_id, attack_id, "Attack job done");
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.db
                    .set_job_status(job_id, JobStatus::Failed, Some(&message))
                    .await?;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, job_id: &str, attack_id: &str) -> Result<()> {
        // Validation: an attack with nothing to run is rejected, and that
        // is the job's (successful) result.
        if self.db.count_attack_files(attack_id).await? == 0 {
            let message = "attack submission has no files";
            warn!(attack_id, "{message}");
            self.db.mark_attack_failed(attack_id, message).await?;
            return Ok(());
        }
        self.db.mark_attack_ready(attack_id).await?;

        let defenses = self.db.validated_defenses().await?;
        info!(attack_id, defenses = defenses.len(), "Routing attack to validated defenses");

        for defense in &defenses {
            self.route_to_defense(job_id, &defense.id, attack_id).await?;
        }
        Ok(())
    }

    async fn route_to_defense(&self, job_id: &str, defense_id: &str, attack_id: &str) -> Result<()> {
        // Durable check first: a pair already in flight needs nothing.
        if self.db.active_run_exists(defense_id, attack_id).await? {
            debug!(defense_id, attack_id, "Active run exists; skipping");
            return Ok(());
        }

        // The atomic gate. Losing it means a concurrent dispatcher (or a
        // worker backfill) owns this pair.
        if !self
            .registry
            .claim_evaluation(defense_id, attack_id, job_id)
            .await?
        {
            debug!(defense_id, attack_id, "Pair claimed elsewhere; skipping");
            return Ok(());
        }

        // Prefer a live worker: pushing onto an OPEN queue reuses the
        // already-running container. The snapshot can go stale — a refused
        // push just moves on to the next candidate.
        for worker_id in self.registry.open_workers_for(defense_id).await? {
            if self.registry.push_attack(&worker_id, attack_id).await? {
                info!(defense_id, attack_id, worker_id = %worker_id, "Attack pushed to live worker");
                return Ok(());
            }
            debug!(worker_id = %worker_id, "Push refused (queue closed concurrently); trying next");
        }

        // No live worker took it: spin up a fresh defense-job.
        let payload = json!({ "defense_submission_id": defense_id });
        let new_job_id = self.db.create_job(JobKind::Defense, &payload, None).await?;
        self.broker
            .publish(&TaskEnvelope::RunDefenseJob {
                job_id: new_job_id.clone(),
                defense_submission_id: defense_id.to_string(),
                scope: None,
                include_behavior_different: None,
            })
            .await?;
        info!(defense_id, attack_id, new_job_id = %new_job_id, "No open worker; defense job enqueued");
        Ok(())
    }
}
