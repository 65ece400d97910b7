//! Crucible evaluation worker.
//!
//! Usage:
//!     crucible-worker --redis-url redis://127.0.0.1:6379/0 --database-url crucible.db

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crucible_db::CrucibleDb;
use crucible_protocol::{TaskEnvelope, WorkerSettings};
use crucible_registry::{RedisBroker, RedisRegistry, TaskBroker};
use crucible_worker::{
    AttackDispatcher, BlobStore, DefenseExecutor, DockerRuntime, HttpGateway, ShutdownToken,
};

#[derive(Parser, Debug)]
#[command(name = "crucible-worker", about = "Evaluation worker for the Crucible platform")]
struct Args {
    /// Redis endpoint backing the registry and the broker
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    redis_url: String,

    /// Store path (or sqlite: URL)
    #[arg(long, env = "DATABASE_URL", default_value = "crucible.db")]
    database_url: String,

    /// Broker queue name
    #[arg(long, env = "CRUCIBLE_QUEUE", default_value_t = crucible_protocol::DEFAULT_QUEUE.to_string())]
    queue: String,

    /// Egress gateway endpoint
    #[arg(long, env = "GATEWAY_URL", default_value = "http://crucible-gateway:8080/")]
    gateway_url: String,

    /// Shared gateway secret
    #[arg(long, env = "GATEWAY_SECRET", hide_env_values = true, default_value = "")]
    gateway_secret: String,

    /// Docker name of the gateway container (joined to each job network)
    #[arg(long, env = "GATEWAY_CONTAINER", default_value = "crucible-gateway")]
    gateway_container: String,

    /// Blob store root directory
    #[arg(long, env = "BLOB_ROOT", default_value = "blobs")]
    blob_root: PathBuf,

    /// Settings file
    #[arg(long, default_value = "crucible.yaml")]
    settings: PathBuf,

    /// Mirror the full log filter on stderr
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    crucible_logging::init_logging("crucible-worker", args.verbose)?;

    let settings = WorkerSettings::load(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;

    // Assemble shared dependencies once; everything downstream receives
    // them through constructors.
    let db = CrucibleDb::open(&args.database_url)
        .await
        .with_context(|| format!("opening store {}", args.database_url))?;
    let registry = Arc::new(RedisRegistry::connect(&args.redis_url).await?);
    let broker: Arc<dyn TaskBroker> =
        Arc::new(RedisBroker::connect(&args.redis_url, &args.queue).await?);
    let blob = BlobStore::local(&args.blob_root)?;
    let runtime = Arc::new(DockerRuntime::connect()?);
    let gateway = Arc::new(HttpGateway::new(&args.gateway_url, &args.gateway_secret));

    let shutdown = ShutdownToken::new();
    spawn_signal_listener(shutdown.clone());

    let executor = DefenseExecutor::new(
        db.clone(),
        registry.clone(),
        blob.clone(),
        runtime,
        gateway,
        settings,
        args.gateway_container.clone(),
        shutdown.clone(),
    );
    let dispatcher = AttackDispatcher::new(db, registry, broker.clone());

    info!("Crucible worker consuming queue '{}'", args.queue);
    consume(broker.as_ref(), &executor, &dispatcher, &shutdown).await;
    info!("Worker stopped");
    Ok(())
}

/// One envelope at a time, until shutdown. A failed job is logged and the
/// loop moves on — the job row carries the failure.
async fn consume(
    broker: &dyn TaskBroker,
    executor: &DefenseExecutor,
    dispatcher: &AttackDispatcher,
    shutdown: &ShutdownToken,
) {
    while !shutdown.is_cancelled() {
        let envelope = match broker.next(Duration::from_secs(1)).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) => {
                error!("Broker error: {e}; backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        info!(job_id = envelope.job_id(), task = envelope.task_name(), "Envelope received");
        let result = match &envelope {
            TaskEnvelope::RunDefenseJob { job_id, defense_submission_id, .. } => {
                executor.run(job_id, defense_submission_id).await
            }
            TaskEnvelope::RunAttackJob { job_id, attack_submission_id } => {
                dispatcher.run(job_id, attack_submission_id).await
            }
        };
        if let Err(e) = result {
            error!("Job {} failed: {e:#}", envelope.job_id());
        }
    }
}

fn spawn_signal_listener(shutdown: ShutdownToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received; finishing current job");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
