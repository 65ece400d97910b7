//! Defense executor: the state machine behind a defense-job envelope.
//!
//! Phases, in order: register worker, backfill the internal queue, obtain
//! the image, bring up the sandbox, wait for readiness, validate the
//! contract (first run only), drain the evaluation loop, tear down. Phase
//! teardown always runs, and its errors never overwrite the job outcome.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crucible_db::{CrucibleDb, JobStatus};
use crucible_protocol::WorkerSettings;
use crucible_registry::Registry;

use crate::blob::BlobStore;
use crate::evaluate::{self, EvalEnv};
use crate::gateway::Gateway;
use crate::sandbox::{ContainerRuntime, Sandbox};
use crate::shutdown::ShutdownToken;
use crate::source;
use crate::validation::validate_functional;

pub struct DefenseExecutor {
    db: CrucibleDb,
    registry: Arc<dyn Registry>,
    blob: BlobStore,
    runtime: Arc<dyn ContainerRuntime>,
    gateway: Arc<dyn Gateway>,
    settings: WorkerSettings,
    /// Docker name of the gateway proxy, joined to each job-private network.
    gateway_container: String,
    shutdown: ShutdownToken,
}

impl DefenseExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: CrucibleDb,
        registry: Arc<dyn Registry>,
        blob: BlobStore,
        runtime: Arc<dyn ContainerRuntime>,
        gateway: Arc<dyn Gateway>,
        settings: WorkerSettings,
        gateway_container: String,
        shutdown: ShutdownToken,
    ) -> Self {
        Self { db, registry, blob, runtime, gateway, settings, gateway_container, shutdown }
    }

    /// Handle one defense-job envelope end to end.
    pub async fn run(&self, job_id: &str, defense_id: &str) -> Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            warn!(job_id, "Defense envelope names an unknown job; dropping");
            return Ok(());
        };
        // The broker redelivers; a job that already left `queued` has been
        // (or is being) handled. No side effects on redelivery.
        if job.status != JobStatus::Queued {
            info!(job_id, status = %job.status, "Redelivered defense envelope is a no-op");
            return Ok(());
        }

        // Phase A — register. The worker id embeds the job id for
        // traceability in registry dumps.
        let worker_id = format!("worker_{job_id}_{}", short_token());
        self.registry.register(&worker_id, defense_id, job_id).await?;
        if let Err(e) = self.db.set_job_status(job_id, JobStatus::Running, None).await {
            let _ = self.registry.unregister(&worker_id).await;
            return Err(e.into());
        }

        let outcome = self.execute(&worker_id, job_id, defense_id).await;

        // Phase H — the registry side of teardown, unconditionally.
        if let Err(e) = self.registry.unregister(&worker_id).await {
            warn!(worker_id, "Failed to unregister worker: {e}");
        }

        match outcome {
            Ok(()) => {
                self.db.set_job_status(job_id, JobStatus::Done, None).await?;
                info!(job_id, "Defense job done");
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(db_err) = self
                    .db
                    .set_job_status(job_id, JobStatus::Failed, Some(&message))
                    .await
                {
                    error!(job_id, "Could not record job failure '{message}': {db_err}");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, worker_id: &str, job_id: &str, defense_id: &str) -> Result<()> {
        // Phase B — backfill the queue with attacks this defense has never
        // seen. Concurrent attack-jobs may race this snapshot; the claim
        // key arbitrates.
        self.backfill_queue(worker_id, job_id, defense_id).await?;

        // Phase C — obtain the image.
        let defense_source = self.db.defense_source(defense_id).await?;
        let image = match source::resolve(
            self.runtime.as_ref(),
            &self.blob,
            defense_id,
            &defense_source,
            &self.settings.source,
        )
        .await
        {
            Ok(image) => image,
            Err(e) if e.is_rejection() => {
                let message = e.to_string();
                self.db
                    .set_defense_functional(defense_id, false, Some(&message))
                    .await?;
                bail!("defense source rejected: {message}");
            }
            Err(e) => return Err(anyhow::Error::new(e).context("obtaining defense image")),
        };

        // Phase D — sandbox up.
        let sandbox = Sandbox::launch(
            self.runtime.as_ref(),
            job_id,
            &image,
            &self.settings.defense_job,
            &self.gateway_container,
        )
        .await
        .context("setting up sandbox")?;
        let container_url = sandbox.container.url();

        let result = self
            .run_in_sandbox(worker_id, defense_id, &image, &container_url)
            .await;

        // Phase H — container/network teardown, win or lose.
        sandbox.teardown(self.runtime.as_ref()).await;
        result
    }

    async fn run_in_sandbox(
        &self,
        worker_id: &str,
        defense_id: &str,
        image: &str,
        container_url: &str,
    ) -> Result<()> {
        // Phase E — readiness.
        self.await_ready(container_url).await?;

        // Phase F — functional validation, only while the verdict is
        // unknown.
        let submission = self
            .db
            .get_submission(defense_id)
            .await?
            .with_context(|| format!("defense submission {defense_id} missing"))?;
        if submission.is_functional.is_none() {
            match validate_functional(
                self.runtime.as_ref(),
                self.gateway.as_ref(),
                image,
                container_url,
                &self.settings,
            )
            .await
            {
                Ok(()) => {
                    self.db.set_defense_functional(defense_id, true, None).await?;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.db
                        .set_defense_functional(defense_id, false, Some(&message))
                        .await?;
                    bail!("functional validation failed: {message}");
                }
            }
        }

        // Phase G — drain the internal queue.
        let env = EvalEnv {
            db: &self.db,
            registry: self.registry.as_ref(),
            blob: &self.blob,
            gateway: self.gateway.as_ref(),
            settings: &self.settings,
            shutdown: &self.shutdown,
        };
        evaluate::drain_queue(&env, worker_id, defense_id, container_url).await
    }

    async fn backfill_queue(&self, worker_id: &str, job_id: &str, defense_id: &str) -> Result<()> {
        let pending = self.db.unevaluated_attacks_for(defense_id).await?;
        info!(defense_id, pending = pending.len(), "Backfilling internal queue");
        for attack_id in pending {
            if !self
                .registry
                .claim_evaluation(defense_id, &attack_id, job_id)
                .await?
            {
                // The claim is held elsewhere. If another live worker can
                // serve the pair, or a run is already active, it is truly
                // taken. Otherwise the claim is a hand-off — an attack
                // dispatcher that found no open worker and queued this very
                // job, or a worker that crashed after claiming — and waiting
                // out the claim TTL would starve the pair. Adopt it.
                let other_open = self
                    .registry
                    .open_workers_for(defense_id)
                    .await?
                    .into_iter()
                    .any(|candidate| candidate != worker_id);
                if other_open || self.db.active_run_exists(defense_id, &attack_id).await? {
                    debug!(%attack_id, "Pair claimed and served elsewhere; skipping backfill");
                    continue;
                }
                info!(%attack_id, "Adopting claimed but unserved pair");
            }
            if !self.registry.push_attack(worker_id, &attack_id).await? {
                warn!(worker_id, %attack_id, "Backfill push refused by own queue");
            }
        }
        Ok(())
    }

    /// Poll through the gateway until the container answers with anything
    /// but 502, or the readiness deadline passes.
    async fn await_ready(&self, container_url: &str) -> Result<()> {
        let limit = self.settings.defense_job.container_timeout;
        let deadline = Instant::now() + Duration::from_secs(limit);
        let timeout = Duration::from_secs(self.settings.evaluation.requests_timeout_seconds);

        loop {
            match self.gateway.get(container_url, timeout).await {
                Ok(response) if response.status != 502 => {
                    debug!(container_url, status = response.status, "Container ready");
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                bail!("container did not become ready within {limit}s");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn short_token() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
