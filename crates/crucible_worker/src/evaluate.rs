//! The evaluation loop (Phase G).
//!
//! Invariant: the caller owns a live, validated defense container at
//! `container_url`, and this loop drains the worker's internal queue
//! through it — one attack at a time, one file at a time, in file-creation
//! order. Per-file failures are recorded and never abort the loop; only
//! store/registry loss does.
//!
//! The loop has no natural terminator. It exits when the queue has been
//! CLOSED (by shutdown or the optional idle timeout) and then drained; it
//! never exits while the queue is non-empty and OPEN.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crucible_db::{AttackFile, CrucibleDb};
use crucible_protocol::{parse_prediction, WorkerSettings};
use crucible_registry::Registry;

use crate::blob::BlobStore;
use crate::gateway::{Gateway, GatewayError, GatewayResponse};
use crate::shutdown::ShutdownToken;

/// Everything the loop needs, threaded in by the executor.
pub struct EvalEnv<'a> {
    pub db: &'a CrucibleDb,
    pub registry: &'a dyn Registry,
    pub blob: &'a BlobStore,
    pub gateway: &'a dyn Gateway,
    pub settings: &'a WorkerSettings,
    pub shutdown: &'a ShutdownToken,
}

/// Drain the worker's internal queue until it is CLOSED and empty.
pub async fn drain_queue(
    env: &EvalEnv<'_>,
    worker_id: &str,
    defense_id: &str,
    container_url: &str,
) -> Result<()> {
    // attack -> run id, so one attack popped twice before completion does
    // not open two runs. A cache only; rebuilding it costs one query.
    let mut run_cache: HashMap<String, String> = HashMap::new();

    // BLPOP treats 0 as "forever", so the floor is 1s; this is also what
    // keeps the loop responsive to shutdown.
    let poll_timeout = Duration::from_secs(env.settings.evaluation.poll_timeout_seconds.max(1));
    let idle_limit = env.settings.defense_job.idle_timeout_seconds.map(Duration::from_secs);

    let mut queue_closed = false;
    let mut idle_since = Instant::now();

    info!(worker_id, defense_id, "Entering evaluation loop");
    loop {
        if env.shutdown.is_cancelled() && !queue_closed {
            info!(worker_id, "Shutdown requested; closing queue and draining");
            env.registry.close_queue(worker_id).await?;
            queue_closed = true;
        }

        let popped = env
            .registry
            .pop_attack(worker_id, poll_timeout)
            .await
            .context("popping from internal queue")?;

        let Some(attack_id) = popped else {
            env.registry.heartbeat(worker_id).await?;
            if queue_closed {
                // closed and empty: drained
                break;
            }
            if let Some(limit) = idle_limit {
                if idle_since.elapsed() >= limit {
                    info!(worker_id, "Idle for {}s; closing queue", limit.as_secs());
                    env.registry.close_queue(worker_id).await?;
                    queue_closed = true;
                }
            }
            continue;
        };

        process_attack(env, &mut run_cache, defense_id, &attack_id, container_url).await?;
        env.registry.heartbeat(worker_id).await?;
        idle_since = Instant::now();
    }

    info!(worker_id, "Evaluation loop drained");
    Ok(())
}

/// Run every file of one attack through the defense and settle the run.
async fn process_attack(
    env: &EvalEnv<'_>,
    run_cache: &mut HashMap<String, String>,
    defense_id: &str,
    attack_id: &str,
    container_url: &str,
) -> Result<()> {
    info!(attack_id, defense_id, "Processing attack");

    // The same attack can land in the queue twice (a dispatcher push racing
    // this worker's own backfill). Whoever finished first settled the pair.
    if !run_cache.contains_key(attack_id)
        && env.db.completed_run_exists(defense_id, attack_id).await?
    {
        debug!(attack_id, "Pair already completed; dropping duplicate queue entry");
        return Ok(());
    }

    let run_id = match run_cache.get(attack_id) {
        Some(run_id) => run_id.clone(),
        None => {
            let run = env
                .db
                .ensure_run(defense_id, attack_id)
                .await
                .context("ensuring evaluation run")?;
            run_cache.insert(attack_id.to_string(), run.id.clone());
            run.id
        }
    };

    let files = env.db.attack_files(attack_id).await?;
    debug!(attack_id, files = files.len(), "Fetched attack files");

    let outcome = async {
        for file in &files {
            evaluate_file(env, &run_id, file, container_url).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    match outcome {
        Ok(()) => {
            env.db.complete_run(&run_id).await?;
            // a completed run must not be reused if the attack comes back
            run_cache.remove(attack_id);
            Ok(())
        }
        Err(e) => {
            // the abort is job-level; record it on the run before it
            // propagates
            let _ = env.db.fail_run(&run_id).await;
            Err(e)
        }
    }
}

/// Evaluate one file. Every outcome — including transport and contract
/// failures — lands as exactly one result row; only a store failure
/// escapes.
async fn evaluate_file(
    env: &EvalEnv<'_>,
    run_id: &str,
    file: &AttackFile,
    container_url: &str,
) -> Result<()> {
    let bytes = match env.blob.get(&file.object_key).await {
        Ok(bytes) => bytes,
        Err(e) => {
            env.db
                .insert_result(run_id, &file.id, None, Some(&format!("blob download failed: {e}")), 0)
                .await?;
            return Ok(());
        }
    };

    let timeout = Duration::from_secs(env.settings.evaluation.requests_timeout_seconds);
    let started = Instant::now();
    let outcome = post_with_retry(env.gateway, container_url, bytes, timeout).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (model_output, error) = match outcome {
        Ok(response) => {
            match parse_prediction(response.status, response.content_type.as_deref(), &response.body)
            {
                Ok(label) => (Some(label as i64), None),
                Err(e) => (None, Some(e.to_string())),
            }
        }
        Err(e) => (None, Some(e.to_string())),
    };

    if let Some(ref error) = error {
        debug!(file_id = %file.id, error = %error, "File evaluation missed");
    }
    env.db
        .insert_result(run_id, &file.id, model_output, error.as_deref(), duration_ms)
        .await?;
    Ok(())
}

/// One retry, for connection-class errors only. Timeouts and HTTP-level
/// failures are the defense's answer; asking twice would skew results.
async fn post_with_retry(
    gateway: &dyn Gateway,
    container_url: &str,
    bytes: Bytes,
    timeout: Duration,
) -> Result<GatewayResponse, GatewayError> {
    match gateway.post(container_url, bytes.clone(), timeout).await {
        Err(GatewayError::Connect(first)) => {
            debug!("connection error ({first}), retrying once");
            gateway.post(container_url, bytes, timeout).await
        }
        other => other,
    }
}
