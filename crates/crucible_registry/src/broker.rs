//! Task broker clients.
//!
//! The broker is a single Redis list: the dispatch API `LPUSH`es JSON
//! envelopes, worker processes `BRPOP` them one at a time — prefetch of one,
//! so a long-running defense job never starves peers by hoarding messages.
//! Delivery is at-least-once; every handler must tolerate redelivery.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;

use crucible_protocol::TaskEnvelope;

use crate::Result;

/// A queue of work envelopes.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Enqueue an envelope.
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<()>;

    /// Wait up to `timeout` for the next envelope. A payload that does not
    /// parse is consumed, logged and reported as `None` — garbage is not
    /// redelivered forever.
    async fn next(&self, timeout: Duration) -> Result<Option<TaskEnvelope>>;
}

/// Redis list broker.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    queue: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, queue: queue.to_string() })
    }
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.lpush(&self.queue, payload).await?;
        Ok(())
    }

    async fn next(&self, timeout: Duration) -> Result<Option<TaskEnvelope>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.brpop(&self.queue, timeout.as_secs_f64()).await?;
        let Some((_key, payload)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                warn!("Dropping unparseable broker payload ({e}): {payload}");
                Ok(None)
            }
        }
    }
}

/// Single-process broker for tests and local development.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queue: Arc<Mutex<VecDeque<String>>>,
    wakeup: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
    async fn publish(&self, envelope: &TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        self.queue.lock().await.push_back(payload);
        self.wakeup.notify_one();
        Ok(())
    }

    async fn next(&self, timeout: Duration) -> Result<Option<TaskEnvelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self.queue.lock().await.pop_front() {
                match serde_json::from_str(&payload) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(e) => {
                        warn!("Dropping unparseable broker payload ({e}): {payload}");
                        return Ok(None);
                    }
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.wakeup.notified()).await;
        }
    }
}
