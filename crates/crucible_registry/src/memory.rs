//! In-memory registry backend.
//!
//! Semantics match [`crate::RedisRegistry`] closely enough that the worker
//! and dispatcher cannot tell them apart: FIFO per-worker queues, blocking
//! pops with timeout, OPEN/CLOSED gating on push, TTL'd claims. Used by the
//! test suites and by single-node development without a Redis instance.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{epoch_seconds, QueueState, Registry, Result, WorkerRecord, CLAIM_TTL};

struct WorkerEntry {
    record: WorkerRecord,
    queue: VecDeque<String>,
    wakeup: Arc<Notify>,
}

#[derive(Default)]
struct State {
    workers: HashMap<String, WorkerEntry>,
    active: HashSet<String>,
    claims: HashMap<(String, String), (String, Instant)>,
}

/// Single-process registry.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job id currently holding the claim for a pair, if unexpired.
    pub async fn claim_holder(&self, defense_id: &str, attack_id: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let key = (defense_id.to_string(), attack_id.to_string());
        match state.claims.get(&key) {
            Some((job_id, expiry)) if *expiry > Instant::now() => Some(job_id.clone()),
            Some(_) => {
                state.claims.remove(&key);
                None
            }
            None => None,
        }
    }

    /// True when no key in the registry refers to this worker.
    pub async fn is_fully_removed(&self, worker_id: &str) -> bool {
        let state = self.state.lock().await;
        !state.workers.contains_key(worker_id) && !state.active.contains(worker_id)
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(
        &self,
        worker_id: &str,
        defense_submission_id: &str,
        job_id: &str,
    ) -> Result<()> {
        let now = epoch_seconds();
        let mut state = self.state.lock().await;
        state.workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                record: WorkerRecord {
                    defense_submission_id: defense_submission_id.to_string(),
                    job_id: job_id.to_string(),
                    started_at: now,
                    queue_state: QueueState::Open,
                    heartbeat: now,
                },
                queue: VecDeque::new(),
                wakeup: Arc::new(Notify::new()),
            },
        );
        state.active.insert(worker_id.to_string());
        Ok(())
    }

    async fn push_attack(&self, worker_id: &str, attack_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(worker_id) {
            Some(entry) if entry.record.queue_state == QueueState::Open => {
                entry.queue.push_back(attack_id.to_string());
                entry.wakeup.notify_one();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pop_attack(&self, worker_id: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let wakeup = {
                let mut state = self.state.lock().await;
                let Some(entry) = state.workers.get_mut(worker_id) else {
                    return Ok(None);
                };
                if let Some(attack_id) = entry.queue.pop_front() {
                    return Ok(Some(attack_id));
                }
                Arc::clone(&entry.wakeup)
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake on push or give up at the deadline. A stolen wakeup just
            // loops back to re-check the queue.
            let _ = tokio::time::timeout(deadline - now, wakeup.notified()).await;
            if Instant::now() >= deadline {
                // one last look before reporting empty
                let mut state = self.state.lock().await;
                return Ok(state
                    .workers
                    .get_mut(worker_id)
                    .and_then(|entry| entry.queue.pop_front()));
            }
        }
    }

    async fn close_queue(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.workers.get_mut(worker_id) {
            entry.record.queue_state = QueueState::Closed;
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.workers.get_mut(worker_id) {
            entry.record.heartbeat = epoch_seconds();
        }
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.workers.remove(worker_id) {
            // unblock any pending pop so it can observe the removal
            entry.wakeup.notify_waiters();
        }
        state.active.remove(worker_id);
        Ok(())
    }

    async fn open_workers_for(&self, defense_submission_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let mut open: Vec<String> = state
            .workers
            .iter()
            .filter(|(id, entry)| {
                state.active.contains(*id)
                    && entry.record.defense_submission_id == defense_submission_id
                    && entry.record.queue_state == QueueState::Open
            })
            .map(|(id, _)| id.clone())
            .collect();
        open.sort();
        Ok(open)
    }

    async fn claim_evaluation(
        &self,
        defense_submission_id: &str,
        attack_submission_id: &str,
        job_id: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (defense_submission_id.to_string(), attack_submission_id.to_string());
        let now = Instant::now();
        if let Some((_, expiry)) = state.claims.get(&key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        state.claims.insert(key, (job_id.to_string(), now + CLAIM_TTL));
        Ok(true)
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>> {
        let state = self.state.lock().await;
        Ok(state.workers.get(worker_id).map(|e| e.record.clone()))
    }

    async fn queue_len(&self, worker_id: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.workers.get(worker_id).map(|e| e.queue.len()).unwrap_or(0))
    }
}
