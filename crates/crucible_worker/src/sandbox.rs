//! Sandbox lifecycle for untrusted defense containers.
//!
//! Every defense job gets its own egress-blocked network; the gateway proxy
//! is connected to it, the hardened defense container is started on it, and
//! both are torn back down when the job ends. The container is addressable
//! only from the gateway.

use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, HostConfig, HostConfigLogConfig, NetworkConnectRequest,
    NetworkCreateRequest, NetworkDisconnectRequest,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crucible_protocol::{DefenseJobSettings, SourceSettings};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("image not present after pull: {0}")]
    ImageMissing(String),

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("image build exceeded {0}s wall-clock bound")]
    BuildTimeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hardened run parameters for one defense container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub mem_limit_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u64,
}

impl ContainerSpec {
    pub fn from_settings(
        name: String,
        image: String,
        network: String,
        cfg: &DefenseJobSettings,
    ) -> Self {
        Self {
            name,
            image,
            network,
            mem_limit_bytes: cfg.mem_limit_bytes,
            nano_cpus: cfg.nano_cpus,
            pids_limit: cfg.pids_limit,
            tmpfs_size_mb: cfg.tmpfs_size_mb,
        }
    }
}

/// A started container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

impl ContainerHandle {
    /// The container's endpoint as seen from the gateway's side of the
    /// private network.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.name, crucible_protocol::wire::DEFENSE_PORT)
    }
}

/// Container/network/image operations the executor needs. Implemented by
/// [`DockerRuntime`] in deployments and by a scriptable fake in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<(), SandboxError>;

    async fn image_size_bytes(&self, reference: &str) -> Result<u64, SandboxError>;

    /// Build `tag` from the Dockerfile at the root of `context`, honoring
    /// the source-safety settings (no cache, no network, wall-time bound).
    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        settings: &SourceSettings,
    ) -> Result<(), SandboxError>;

    /// Create an internal (egress-blocked) network; returns its name.
    async fn create_network(&self, name: &str) -> Result<String, SandboxError>;

    async fn connect_container(&self, network: &str, container: &str) -> Result<(), SandboxError>;

    async fn disconnect_container(&self, network: &str, container: &str)
        -> Result<(), SandboxError>;

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError>;

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), SandboxError>;

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;
}

// ============================================================================
// Per-job sandbox lifecycle
// ============================================================================

/// A job-private network with the gateway and one defense container on it.
pub struct Sandbox {
    pub network: String,
    pub container: ContainerHandle,
    gateway_container: String,
}

impl Sandbox {
    pub fn network_name(job_id: &str) -> String {
        format!("crucible_net_{job_id}")
    }

    pub fn container_name(job_id: &str) -> String {
        format!("crucible_defense_{job_id}")
    }

    /// Phase D: network up, gateway attached, container started. Partial
    /// failures unwind whatever already exists before returning the error.
    pub async fn launch(
        runtime: &dyn ContainerRuntime,
        job_id: &str,
        image: &str,
        cfg: &DefenseJobSettings,
        gateway_container: &str,
    ) -> Result<Self, SandboxError> {
        let network = Self::network_name(job_id);
        runtime.create_network(&network).await?;

        if let Err(e) = runtime.connect_container(&network, gateway_container).await {
            let _ = runtime.remove_network(&network).await;
            return Err(e);
        }

        let spec = ContainerSpec::from_settings(
            Self::container_name(job_id),
            image.to_string(),
            network.clone(),
            cfg,
        );
        let container = match runtime.start_container(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = runtime.disconnect_container(&network, gateway_container).await;
                let _ = runtime.remove_network(&network).await;
                return Err(e);
            }
        };

        info!(network = %network, container = %container.name, "Sandbox up");
        Ok(Self {
            network,
            container,
            gateway_container: gateway_container.to_string(),
        })
    }

    /// Phase H: stop and remove the container, detach the gateway, remove
    /// the network. Errors are logged and swallowed — teardown never masks
    /// the job's outcome.
    pub async fn teardown(self, runtime: &dyn ContainerRuntime) {
        if let Err(e) = runtime.stop_container(&self.container.id, Duration::from_secs(2)).await {
            warn!("Failed to stop container {}: {e}", self.container.name);
        }
        if let Err(e) = runtime.remove_container(&self.container.id).await {
            warn!("Failed to remove container {}: {e}", self.container.name);
        }
        if let Err(e) = runtime
            .disconnect_container(&self.network, &self.gateway_container)
            .await
        {
            warn!("Failed to disconnect gateway from {}: {e}", self.network);
        }
        if let Err(e) = runtime.remove_network(&self.network).await {
            warn!("Failed to remove network {}: {e}", self.network);
        }
    }
}

// ============================================================================
// Docker implementation
// ============================================================================

/// Runtime over the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        Ok(Self { docker: Docker::connect_with_local_defaults()? })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, reference: &str) -> Result<(), SandboxError> {
        let options = CreateImageOptionsBuilder::default().from_image(reference).build();
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            update?;
        }
        // pull reported success; verify the image is actually present
        self.docker
            .inspect_image(reference)
            .await
            .map_err(|_| SandboxError::ImageMissing(reference.to_string()))?;
        Ok(())
    }

    async fn image_size_bytes(&self, reference: &str) -> Result<u64, SandboxError> {
        let inspect = self.docker.inspect_image(reference).await?;
        Ok(inspect.size.unwrap_or(0).max(0) as u64)
    }

    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        settings: &SourceSettings,
    ) -> Result<(), SandboxError> {
        // The build endpoint takes the context as a tarball.
        let mut archive = tar::Builder::new(Vec::new());
        archive.append_dir_all(".", context)?;
        let tarball = archive.into_inner()?;

        let mut options = BuildImageOptionsBuilder::default()
            .t(tag)
            .nocache(settings.no_cache)
            .rm(true)
            .forcerm(true);
        if settings.network_disabled {
            options = options.networkmode("none");
        }

        let build = async {
            let mut progress = self.docker.build_image(
                options.build(),
                None,
                Some(bollard::body_full(tarball.into())),
            );
            while let Some(update) = progress.next().await {
                let info = update?;
                if let Some(error) = info.error {
                    return Err(SandboxError::BuildFailed(error));
                }
                if let Some(line) = info.stream {
                    let line = line.trim();
                    if !line.is_empty() {
                        info!(target: "crucible_worker::build", "{line}");
                    }
                }
            }
            Ok(())
        };

        match tokio::time::timeout(Duration::from_secs(settings.max_build_time_seconds), build)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::BuildTimeout(settings.max_build_time_seconds)),
        }
    }

    async fn create_network(&self, name: &str) -> Result<String, SandboxError> {
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                internal: Some(true),
                ..Default::default()
            })
            .await?;
        Ok(name.to_string())
    }

    async fn connect_container(&self, network: &str, container: &str) -> Result<(), SandboxError> {
        self.docker
            .connect_network(
                network,
                NetworkConnectRequest {
                    container: Some(container.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_container(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), SandboxError> {
        self.docker
            .disconnect_network(
                network,
                NetworkDisconnectRequest {
                    container: Some(container.to_string()),
                    force: Some(true),
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError> {
        self.docker.remove_network(network).await?;
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, SandboxError> {
        let tmpfs_opts = format!("rw,noexec,nosuid,size={}m", spec.tmpfs_size_mb);
        let tmpfs: HashMap<String, String> = ["/tmp", "/run", "/var/tmp"]
            .into_iter()
            .map(|dir| (dir.to_string(), tmpfs_opts.clone()))
            .collect();

        let host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            memory: Some(spec.mem_limit_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(tmpfs),
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(HashMap::from([
                    ("max-size".to_string(), "10m".to_string()),
                    ("max-file".to_string(), "3".to_string()),
                ])),
            }),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            user: Some("65534:65534".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(&spec.name).build();
        let id = self.docker.create_container(Some(options), body).await?.id;
        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await?;

        Ok(ContainerHandle { id, name: spec.name.clone() })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), SandboxError> {
        let options = StopContainerOptionsBuilder::default()
            .t(grace.as_secs() as i32)
            .build();
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}
