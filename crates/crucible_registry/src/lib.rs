//! Worker registry and task broker.
//!
//! The registry is the shared, ephemeral side of the pipeline: which defense
//! workers are alive, their per-worker attack queues with the OPEN/CLOSED
//! marker, heartbeats, and the claim keys that de-duplicate
//! (defense, attack) pairs. Nothing in here is a source of truth — the
//! relational store is; registry state can be rebuilt from scratch after a
//! crash at the cost of some duplicate-avoidance.
//!
//! Two backends: [`RedisRegistry`] for deployments and [`InMemoryRegistry`]
//! for tests and single-node development. Same split for the broker.

pub mod broker;
pub mod memory;
pub mod redis;

pub use broker::{InMemoryBroker, RedisBroker, TaskBroker};
pub use memory::InMemoryRegistry;
pub use redis::RedisRegistry;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Registry operation result type.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry/broker errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt registry entry: {0}")]
    Corrupt(String),
}

/// Claim-key TTL: a safety net against crashed workers that never clean up.
pub const CLAIM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether dispatchers may still append to a worker's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    Closed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A live worker's registry entry. Ephemeral; deleted on unregister.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub defense_submission_id: String,
    pub job_id: String,
    /// Wall-clock seconds since the epoch at registration.
    pub started_at: f64,
    pub queue_state: QueueState,
    /// Wall-clock seconds since the epoch at the last heartbeat.
    pub heartbeat: f64,
}

/// The shared worker registry.
///
/// Ordering: pushes to one worker are FIFO; nothing is promised across
/// workers. `open_workers_for` is a snapshot — a worker seen OPEN may close
/// concurrently, which callers observe as a refused push.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create the worker record with an OPEN queue, add it to the active
    /// set, stamp the first heartbeat.
    async fn register(
        &self,
        worker_id: &str,
        defense_submission_id: &str,
        job_id: &str,
    ) -> Result<()>;

    /// Append an attack to the worker's internal queue. Returns `false`
    /// (without pushing) when the queue is CLOSED or the worker is gone.
    async fn push_attack(&self, worker_id: &str, attack_id: &str) -> Result<bool>;

    /// Blocking pop from the head of the worker's queue, up to `timeout`.
    /// `None` on timeout.
    async fn pop_attack(&self, worker_id: &str, timeout: Duration) -> Result<Option<String>>;

    /// Flip the queue to CLOSED. Subsequent pushes are refused.
    async fn close_queue(&self, worker_id: &str) -> Result<()>;

    /// Refresh the worker's heartbeat timestamp.
    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// Delete the worker record, its queue and its active-set membership.
    async fn unregister(&self, worker_id: &str) -> Result<()>;

    /// Active workers for this defense whose queue is OPEN.
    async fn open_workers_for(&self, defense_submission_id: &str) -> Result<Vec<String>>;

    /// Atomic set-if-absent on the pair's claim key (TTL [`CLAIM_TTL`]).
    /// `true` iff this caller installed the key.
    async fn claim_evaluation(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
        job_id: &str,
    ) -> Result<bool>;

    /// The worker's record, if registered.
    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>>;

    /// Current length of the worker's internal queue.
    async fn queue_len(&self, worker_id: &str) -> Result<usize>;
}

pub(crate) fn epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) mod keys {
    //! Redis key layout, shared by the backend and its tests.

    pub fn worker_meta(worker_id: &str) -> String {
        format!("worker:{worker_id}:meta")
    }

    pub fn worker_queue(worker_id: &str) -> String {
        format!("worker:{worker_id}:attacks")
    }

    pub const ACTIVE_WORKERS: &str = "workers:active";

    pub fn claim(defense_id: &str, attack_id: &str) -> String {
        format!("evaluations:queued:{defense_id}:{attack_id}")
    }
}
