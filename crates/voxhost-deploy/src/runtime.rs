//! Container runtime seam.
//!
//! Lifecycle managers talk to the runtime only through [`ContainerRuntime`],
//! which keeps them independent of the Docker API and lets tests script the
//! runtime's behaviour. [`DockerRuntime`] is the production implementation
//! over the local Docker (or Podman-compatible) socket.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Label attached to every container this crate launches.
pub const PROVIDER_LABEL: &str = "voxhost.provider";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime API error: {0}")]
    Api(String),
}

/// Everything needed to launch one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Internal ports published on an OS-assigned loopback host port each.
    pub ports: Vec<u16>,
    /// Volume name -> container path.
    pub binds: BTreeMap<String, String>,
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub gpu: bool,
    pub labels: BTreeMap<String, String>,
}

/// What the runtime reports about a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInspection {
    pub running: bool,
    pub status: String,
    /// Container port -> host port.
    pub ports: HashMap<u16, u16>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container, returning its identifier.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Docker Engine API implementation of [`ContainerRuntime`].
#[derive(Debug, Clone, Default)]
pub struct DockerRuntime {
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }
}

fn map_docker_error(e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api(other.to_string()),
    }
}

/// Extracts `container port -> host port` pairs from Docker's port map
/// (`"8000/tcp" -> [{HostIp, HostPort}]`).
fn parse_port_map(ports: &HashMap<String, Option<Vec<PortBinding>>>) -> HashMap<u16, u16> {
    let mut mapped = HashMap::new();
    for (container_port, bindings) in ports {
        let Ok(internal) = container_port
            .trim_end_matches("/tcp")
            .trim_end_matches("/udp")
            .parse::<u16>()
        else {
            continue;
        };
        let host = bindings
            .iter()
            .flatten()
            .filter_map(|b| b.host_port.as_deref())
            .filter_map(|p| p.parse::<u16>().ok())
            .find(|p| *p != 0);
        if let Some(host) = host {
            mapped.insert(internal, host);
        }
    }
    mapped
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.map_err(map_docker_error)?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Api(error));
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let docker = self.docker().await?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            // An empty host port asks the runtime for an ephemeral one.
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|(volume, path)| format!("{}:{}", volume, path))
            .collect();

        let device_requests = spec.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            nano_cpus: spec.nano_cpus,
            memory: spec.memory_bytes,
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError> {
        let docker = self.docker().await?;
        let details = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        let (running, status) = details
            .state
            .map(|s| {
                (
                    s.running.unwrap_or(false),
                    s.status.map(|st| st.to_string()).unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        let ports = details
            .network_settings
            .and_then(|n| n.ports)
            .map(|p| parse_port_map(&p))
            .unwrap_or_default();

        Ok(ContainerInspection {
            running,
            status,
            ports,
        })
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(map_docker_error)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
            .map_err(map_docker_error)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_docker_error)
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(map_docker_error)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(map_docker_error)
    }
}
