//! Redis-backed registry.
//!
//! Key layout:
//! - `worker:{id}:meta` — hash: defense_submission_id, job_id, started_at,
//!   queue_state, heartbeat
//! - `worker:{id}:attacks` — list, the worker's internal queue
//! - `workers:active` — set of live worker ids
//! - `evaluations:queued:{defense}:{attack}` — claim key, value = job_id,
//!   TTL 24 h
//!
//! All operations are single commands or one short Lua script; no multi-key
//! transactions are needed.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};

use crate::{epoch_seconds, keys, QueueState, Registry, RegistryError, Result, WorkerRecord, CLAIM_TTL};

/// Pushes must observe the OPEN marker atomically with the append, or a
/// dispatcher could enqueue onto a worker that already decided to drain and
/// exit. One round-trip, evaluated atomically by the server.
const PUSH_IF_OPEN: &str = r#"
if redis.call('HGET', KEYS[1], 'queue_state') == 'OPEN' then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Registry over a shared Redis instance.
#[derive(Clone)]
pub struct RedisRegistry {
    conn: ConnectionManager,
}

impl RedisRegistry {
    /// Connect to `redis://...`. The connection manager reconnects with
    /// backoff on its own.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("Connected registry to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn register(
        &self,
        worker_id: &str,
        defense_submission_id: &str,
        job_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = epoch_seconds().to_string();
        let fields: Vec<(&str, &str)> = vec![
            ("defense_submission_id", defense_submission_id),
            ("job_id", job_id),
            ("started_at", &now),
            ("queue_state", QueueState::Open.as_str()),
            ("heartbeat", &now),
        ];
        let _: () = conn.hset_multiple(keys::worker_meta(worker_id), &fields).await?;
        let _: () = conn.sadd(keys::ACTIVE_WORKERS, worker_id).await?;
        info!(worker_id, defense = defense_submission_id, "Worker registered with OPEN queue");
        Ok(())
    }

    async fn push_attack(&self, worker_id: &str, attack_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let pushed: i64 = Script::new(PUSH_IF_OPEN)
            .key(keys::worker_meta(worker_id))
            .key(keys::worker_queue(worker_id))
            .arg(attack_id)
            .invoke_async(&mut conn)
            .await?;
        debug!(worker_id, attack_id, pushed, "push_attack");
        Ok(pushed == 1)
    }

    async fn pop_attack(&self, worker_id: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .blpop(keys::worker_queue(worker_id), timeout.as_secs_f64())
            .await?;
        Ok(popped.map(|(_key, attack_id)| attack_id))
    }

    async fn close_queue(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(keys::worker_meta(worker_id), "queue_state", QueueState::Closed.as_str())
            .await?;
        info!(worker_id, "Worker queue marked CLOSED");
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(keys::worker_meta(worker_id), "heartbeat", epoch_seconds().to_string())
            .await?;
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(&[keys::worker_meta(worker_id), keys::worker_queue(worker_id)])
            .await?;
        let _: () = conn.srem(keys::ACTIVE_WORKERS, worker_id).await?;
        info!(worker_id, "Worker unregistered");
        Ok(())
    }

    async fn open_workers_for(&self, defense_submission_id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let active: Vec<String> = conn.smembers(keys::ACTIVE_WORKERS).await?;
        let mut open = Vec::new();
        for worker_id in active {
            let meta: std::collections::HashMap<String, String> =
                conn.hgetall(keys::worker_meta(worker_id.as_str())).await?;
            if meta.get("defense_submission_id").map(String::as_str) == Some(defense_submission_id)
                && meta.get("queue_state").map(String::as_str) == Some("OPEN")
            {
                open.push(worker_id);
            }
        }
        Ok(open)
    }

    async fn claim_evaluation(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
        job_id: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let installed: Option<String> = ::redis::cmd("SET")
            .arg(keys::claim(defense_submission_id, attack_submission_id))
            .arg(job_id)
            .arg("NX")
            .arg("EX")
            .arg(CLAIM_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(installed.is_some())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let mut conn = self.conn.clone();
        let meta: std::collections::HashMap<String, String> =
            conn.hgetall(keys::worker_meta(worker_id)).await?;
        if meta.is_empty() {
            return Ok(None);
        }
        record_from_map(worker_id, &meta).map(Some)
    }

    async fn queue_len(&self, worker_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(keys::worker_queue(worker_id)).await?)
    }
}

fn record_from_map(
    worker_id: &str,
    meta: &std::collections::HashMap<String, String>,
) -> Result<WorkerRecord> {
    let field = |name: &str| -> Result<&String> {
        meta.get(name)
            .ok_or_else(|| RegistryError::Corrupt(format!("worker {worker_id} missing {name}")))
    };
    let queue_state = field("queue_state")?;
    Ok(WorkerRecord {
        defense_submission_id: field("defense_submission_id")?.clone(),
        job_id: field("job_id")?.clone(),
        started_at: field("started_at")?.parse().unwrap_or(0.0),
        queue_state: QueueState::parse(queue_state).ok_or_else(|| {
            RegistryError::Corrupt(format!("worker {worker_id} queue_state '{queue_state}'"))
        })?,
        heartbeat: field("heartbeat")?.parse().unwrap_or(0.0),
    })
}
