//! Shared harness for worker integration tests.
//!
//! In-memory registry/broker/blob/store plus scriptable fakes for the two
//! external boundaries: the container runtime and the egress gateway.

// not every test target exercises every helper
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crucible_db::{CrucibleDb, DefenseSource, JobKind};
use crucible_protocol::WorkerSettings;
use crucible_registry::{InMemoryBroker, InMemoryRegistry, Registry};
use crucible_worker::gateway::{Gateway, GatewayError, GatewayResponse};
use crucible_worker::sandbox::{ContainerHandle, ContainerRuntime, ContainerSpec, SandboxError};
use crucible_worker::{AttackDispatcher, BlobStore, DefenseExecutor, ShutdownToken};

// ============================================================================
// Fake container runtime
// ============================================================================

#[derive(Default)]
struct RuntimeState {
    events: Vec<String>,
    networks: HashSet<String>,
    containers: HashMap<String, String>,
    connections: HashSet<(String, String)>,
}

/// Records every runtime call; resources live in-memory so tests can assert
/// that teardown removed them all.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    image_size_bytes: Mutex<u64>,
    pull_error: Mutex<Option<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self::default();
        *runtime.image_size_bytes.lock().unwrap() = 100 * 1024 * 1024;
        runtime
    }

    pub fn set_image_size_mb(&self, mb: u64) {
        *self.image_size_bytes.lock().unwrap() = mb * 1024 * 1024;
    }

    pub fn fail_pulls_with(&self, message: &str) {
        *self.pull_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    /// True when no network, container or connection is left behind.
    pub fn all_cleaned_up(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.networks.is_empty() && state.containers.is_empty() && state.connections.is_empty()
    }

    fn record(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, reference: &str) -> Result<(), SandboxError> {
        if let Some(message) = self.pull_error.lock().unwrap().clone() {
            return Err(SandboxError::ImageMissing(message));
        }
        self.record(format!("pull {reference}"));
        Ok(())
    }

    async fn image_size_bytes(&self, _reference: &str) -> Result<u64, SandboxError> {
        Ok(*self.image_size_bytes.lock().unwrap())
    }

    async fn build_image(
        &self,
        _context: &Path,
        tag: &str,
        _settings: &crucible_protocol::SourceSettings,
    ) -> Result<(), SandboxError> {
        self.record(format!("build {tag}"));
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("create_network {name}"));
        state.networks.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn connect_container(&self, network: &str, container: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("connect {container} -> {network}"));
        state.connections.insert((network.to_string(), container.to_string()));
        Ok(())
    }

    async fn disconnect_container(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("disconnect {container} -> {network}"));
        state.connections.remove(&(network.to_string(), container.to_string()));
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("remove_network {network}"));
        state.networks.remove(network);
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        let id = format!("ctr_{}", spec.name);
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("start {} on {}", spec.name, spec.network));
        state.containers.insert(id.clone(), spec.name.clone());
        Ok(ContainerHandle { id, name: spec.name.clone() })
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), SandboxError> {
        self.record(format!("stop {id}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("remove {id}"));
        state.containers.remove(id);
        Ok(())
    }
}

// ============================================================================
// Fake gateway
// ============================================================================

/// One scripted POST outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond {
        status: u16,
        content_type: Option<&'static str>,
        body: Vec<u8>,
    },
    ConnectError,
    TimeoutError,
}

impl Scripted {
    pub fn result(label: u8) -> Self {
        Self::Respond {
            status: 200,
            content_type: Some("application/json"),
            body: format!(r#"{{"result": {label}}}"#).into_bytes(),
        }
    }
}

/// POSTs consume scripted outcomes in order; when the script runs dry the
/// gateway answers `{"result": <default>}`. GETs (readiness) always succeed.
pub struct FakeGateway {
    script: Mutex<VecDeque<Scripted>>,
    default_label: u8,
    posts: AtomicUsize,
}

impl FakeGateway {
    pub fn answering(default_label: u8) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_label,
            posts: AtomicUsize::new(0),
        }
    }

    pub fn push_outcome(&self, outcome: Scripted) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn post_count(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn post(
        &self,
        _target_url: &str,
        _body: Bytes,
        _timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Scripted::Respond { status, content_type, body }) => Ok(GatewayResponse {
                status,
                content_type: content_type.map(str::to_string),
                body: Bytes::from(body),
            }),
            Some(Scripted::ConnectError) => {
                Err(GatewayError::Connect("connection refused".to_string()))
            }
            Some(Scripted::TimeoutError) => Err(GatewayError::Timeout),
            None => Ok(GatewayResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: Bytes::from(format!(r#"{{"result": {}}}"#, self.default_label)),
            }),
        }
    }

    async fn get(
        &self,
        _target_url: &str,
        _timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        Ok(GatewayResponse {
            status: 200,
            content_type: None,
            body: Bytes::new(),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub db: CrucibleDb,
    pub registry: Arc<InMemoryRegistry>,
    pub broker: Arc<InMemoryBroker>,
    pub blob: BlobStore,
    pub runtime: Arc<FakeRuntime>,
    pub gateway: Arc<FakeGateway>,
    pub settings: WorkerSettings,
    pub shutdown: ShutdownToken,
}

impl Harness {
    /// Defaults tuned for tests: the evaluation loop closes after one idle
    /// poll instead of polling forever.
    pub async fn new() -> Self {
        let mut settings = WorkerSettings::default();
        settings.defense_job.idle_timeout_seconds = Some(0);
        settings.defense_job.container_timeout = 5;

        Self {
            db: CrucibleDb::open_memory().await.unwrap(),
            registry: Arc::new(InMemoryRegistry::new()),
            broker: Arc::new(InMemoryBroker::new()),
            blob: BlobStore::memory(),
            runtime: Arc::new(FakeRuntime::new()),
            gateway: Arc::new(FakeGateway::answering(1)),
            settings,
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn executor(&self) -> DefenseExecutor {
        DefenseExecutor::new(
            self.db.clone(),
            self.registry.clone(),
            self.blob.clone(),
            self.runtime.clone(),
            self.gateway.clone(),
            self.settings.clone(),
            "crucible-gateway".to_string(),
            self.shutdown.clone(),
        )
    }

    pub fn dispatcher(&self) -> AttackDispatcher {
        AttackDispatcher::new(self.db.clone(), self.registry.clone(), self.broker.clone())
    }

    /// A docker-sourced defense, not yet validated.
    pub async fn seed_defense(&self) -> String {
        self.db
            .create_defense(&DefenseSource::DockerImage { reference: "user/clf:v1".to_string() })
            .await
            .unwrap()
    }

    /// A docker-sourced defense that already passed validation.
    pub async fn seed_ready_defense(&self) -> String {
        let id = self.seed_defense().await;
        self.db.set_defense_functional(&id, true, None).await.unwrap();
        id
    }

    /// An attack with one blob-backed file per name, marked ready.
    pub async fn seed_ready_attack(&self, filenames: &[&str]) -> String {
        let attack_id = self.seed_submitted_attack(filenames).await;
        self.db.mark_attack_ready(&attack_id).await.unwrap();
        attack_id
    }

    /// Same, but left in `submitted` (the dispatcher validates it).
    pub async fn seed_submitted_attack(&self, filenames: &[&str]) -> String {
        let attack_id = self.db.create_attack().await.unwrap();
        for name in filenames {
            let key = format!("attacks/{attack_id}/{name}");
            self.blob
                .put(&key, Bytes::from(format!("MZ-{name}-payload")))
                .await
                .unwrap();
            self.db
                .add_attack_file(&attack_id, &key, name, "deadbeef", true)
                .await
                .unwrap();
        }
        attack_id
    }

    pub async fn queued_defense_job(&self, defense_id: &str) -> String {
        let payload = serde_json::json!({ "defense_submission_id": defense_id });
        self.db.create_job(JobKind::Defense, &payload, Some("test")).await.unwrap()
    }

    pub async fn queued_attack_job(&self, attack_id: &str) -> String {
        let payload = serde_json::json!({ "attack_submission_id": attack_id });
        self.db.create_job(JobKind::Attack, &payload, Some("test")).await.unwrap()
    }

    /// Poll until the defense has an OPEN worker (a spawned executor has
    /// reached its evaluation loop) or the deadline passes.
    pub async fn wait_for_open_worker(&self, defense_id: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let workers = self.registry.open_workers_for(defense_id).await.unwrap();
            if let Some(worker) = workers.first() {
                return worker.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no worker registered for defense {defense_id} within 5s"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
