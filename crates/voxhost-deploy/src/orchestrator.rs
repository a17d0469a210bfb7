//! Multi-instance orchestration.
//!
//! The orchestrator owns the provider-id → instance mapping and the only
//! cross-instance shared state: the host port allocator and the volume
//! index, both behind a single mutex. Everything else belongs to exactly
//! one lifecycle manager.

use crate::config::DeployConfig;
use crate::container::{ContainerConfig, ContainerLifecycleManager};
use crate::error::DeployError;
use crate::events::{EventSink, LifecycleEvent};
use crate::lifecycle::ProviderLifecycle;
use crate::ports::PortAllocator;
use crate::process::{ProcessConfig, ProcessLifecycleManager};
use crate::remote::{AuthScheme, RemoteConfig, RemoteConnectionManager};
use crate::runtime::ContainerRuntime;
use crate::streaming::{StreamingConfig, StreamingContainerLifecycleManager};
use crate::templates::TemplateRegistry;
use crate::volumes::VolumeManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use voxhost_types::{DeploymentMode, InstanceOverrides, InstanceStatus, ProviderTemplate};

/// Environment variable carrying the port reserved for a container
/// instance. The runtime still picks the real host port.
pub const RESERVED_PORT_ENV: &str = "VOXHOST_RESERVED_PORT";
pub const RESERVED_STREAM_PORT_ENV: &str = "VOXHOST_RESERVED_STREAM_PORT";

/// The lifecycle manager behind an instance, one variant per mode.
#[derive(Debug)]
pub enum DeploymentManager {
    Container(ContainerLifecycleManager),
    Streaming(StreamingContainerLifecycleManager),
    Process(ProcessLifecycleManager),
    Remote(RemoteConnectionManager),
}

impl DeploymentManager {
    pub fn mode(&self) -> DeploymentMode {
        match self {
            Self::Container(_) => DeploymentMode::Container,
            Self::Streaming(_) => DeploymentMode::StreamingContainer,
            Self::Process(_) => DeploymentMode::Process,
            Self::Remote(_) => DeploymentMode::Remote,
        }
    }

    pub fn lifecycle(&self) -> &dyn ProviderLifecycle {
        match self {
            Self::Container(m) => m,
            Self::Streaming(m) => m,
            Self::Process(m) => m,
            Self::Remote(m) => m,
        }
    }

    pub fn as_container(&self) -> Option<&ContainerLifecycleManager> {
        match self {
            Self::Container(m) => Some(m),
            Self::Streaming(m) => Some(m.container()),
            _ => None,
        }
    }

    pub fn as_streaming(&self) -> Option<&StreamingContainerLifecycleManager> {
        match self {
            Self::Streaming(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&ProcessLifecycleManager> {
        match self {
            Self::Process(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteConnectionManager> {
        match self {
            Self::Remote(m) => Some(m),
            _ => None,
        }
    }
}

/// One tracked provider instance.
#[derive(Debug)]
pub struct InstanceHandle {
    provider_id: String,
    provider_type: String,
    ports: Vec<u16>,
    volumes: Vec<String>,
    created_at: DateTime<Utc>,
    manager: DeploymentManager,
}

impl InstanceHandle {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    pub fn mode(&self) -> DeploymentMode {
        self.manager.mode()
    }

    /// Host ports reserved for this instance.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn manager(&self) -> &DeploymentManager {
        &self.manager
    }

    pub fn lifecycle(&self) -> &dyn ProviderLifecycle {
        self.manager.lifecycle()
    }

    pub async fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            provider_id: self.provider_id.clone(),
            provider_type: self.provider_type.clone(),
            mode: self.mode(),
            ports: self.ports.clone(),
            status: self.lifecycle().status().await,
            endpoint: self.lifecycle().endpoint(),
        }
    }
}

/// Snapshot of an instance for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub provider_id: String,
    pub provider_type: String,
    pub mode: DeploymentMode,
    pub ports: Vec<u16>,
    pub status: InstanceStatus,
    pub endpoint: Option<String>,
}

#[derive(Debug)]
struct SharedResources {
    ports: PortAllocator,
    volumes: VolumeManager,
    /// Ids owned by a live or in-construction instance.
    claimed: HashSet<String>,
}

impl SharedResources {
    fn release(&mut self, provider_id: &str, ports: &[u16]) -> Vec<String> {
        for port in ports {
            self.ports.release(*port);
        }
        self.claimed.remove(provider_id);
        self.volumes.remove_provider_volumes(provider_id)
    }
}

#[derive(Debug)]
pub struct DeploymentOrchestrator {
    config: DeployConfig,
    templates: TemplateRegistry,
    shared: Mutex<SharedResources>,
    instances: RwLock<HashMap<String, Arc<InstanceHandle>>>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    events: EventSink,
}

impl DeploymentOrchestrator {
    pub fn new(
        config: DeployConfig,
        templates: TemplateRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        events: EventSink,
    ) -> Result<Self, DeployError> {
        let ports = PortAllocator::new(config.port_min, config.port_max)?
            .with_host_probe(config.probe_host_ports);
        let volumes = VolumeManager::new(config.volume_base_name.clone());
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DeployError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            templates,
            shared: Mutex::new(SharedResources {
                ports,
                volumes,
                claimed: HashSet::new(),
            }),
            instances: RwLock::new(HashMap::new()),
            runtime,
            http,
            events,
        })
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Builds (but does not start) an instance of `provider_type` under
    /// `provider_id`.
    pub fn create_provider_instance(
        &self,
        provider_id: &str,
        provider_type: &str,
        overrides: InstanceOverrides,
    ) -> Result<Arc<InstanceHandle>, DeployError> {
        let template = self.templates.get(provider_type)?;

        let mut logical_mounts = template.volumes.clone();
        logical_mounts.extend(overrides.volumes.clone());

        let (ports, mounts) = {
            let mut shared = self.lock_shared();
            // The id is claimed in the same critical section as its ports and
            // volumes, so a concurrent create with the same id never touches them.
            if !shared.claimed.insert(provider_id.to_string()) {
                return Err(DeployError::InstanceAlreadyExists(provider_id.to_string()));
            }
            let ports = match allocate_ports(&mut shared.ports, template, overrides.port) {
                Ok(ports) => ports,
                Err(e) => {
                    shared.claimed.remove(provider_id);
                    return Err(e);
                }
            };
            let mounts = match template.mode {
                DeploymentMode::Container | DeploymentMode::StreamingContainer => {
                    shared.volumes.mount_paths_for(provider_id, &logical_mounts)
                }
                DeploymentMode::Process | DeploymentMode::Remote => BTreeMap::new(),
            };
            (ports, mounts)
        };

        let built = self.build_manager(provider_id, template, &overrides, &ports, &mounts);
        let manager = match built {
            Ok(manager) => manager,
            Err(e) => {
                self.lock_shared().release(provider_id, &ports);
                return Err(e);
            }
        };

        let handle = Arc::new(InstanceHandle {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
            ports: ports.clone(),
            volumes: mounts.keys().cloned().collect(),
            created_at: Utc::now(),
            manager,
        });

        self.write_instances()
            .insert(provider_id.to_string(), handle.clone());

        tracing::info!(
            provider_id,
            provider_type,
            mode = %template.mode,
            ports = ?ports,
            "provider instance created"
        );
        self.events.emit(LifecycleEvent::InstanceCreated {
            provider_id: provider_id.to_string(),
            provider_type: provider_type.to_string(),
        });
        Ok(handle)
    }

    fn build_manager(
        &self,
        provider_id: &str,
        template: &ProviderTemplate,
        overrides: &InstanceOverrides,
        ports: &[u16],
        mounts: &BTreeMap<String, String>,
    ) -> Result<DeploymentManager, DeployError> {
        let mut env = template.env.clone();
        env.extend(overrides.env.clone());
        let health = overrides.health.clone().unwrap_or_else(|| template.health.clone());

        let manager = match template.mode {
            DeploymentMode::Container | DeploymentMode::StreamingContainer => {
                let image = overrides
                    .image
                    .clone()
                    .or_else(|| template.image.clone())
                    .unwrap_or_default();
                let mut container = ContainerConfig::new(provider_id, image, template.internal_port);
                container.health = health;
                container.env = env;
                container.volumes = mounts.clone();
                container.limits = overrides
                    .limits
                    .clone()
                    .unwrap_or_else(|| template.limits.clone());
                container.gpu = overrides.gpu.unwrap_or(template.gpu);
                container.pull_attempts = self.config.pull_attempts;
                if let Some(port) = ports.first() {
                    container
                        .env
                        .insert(RESERVED_PORT_ENV.to_string(), port.to_string());
                }

                if template.mode == DeploymentMode::Container {
                    DeploymentManager::Container(ContainerLifecycleManager::new(
                        container,
                        self.runtime.clone(),
                        self.http.clone(),
                        self.events.clone(),
                    ))
                } else {
                    if let Some(port) = ports.get(1) {
                        container
                            .env
                            .insert(RESERVED_STREAM_PORT_ENV.to_string(), port.to_string());
                    }
                    let streaming = StreamingConfig::new(container, template.stream_port.unwrap_or(0));
                    DeploymentManager::Streaming(StreamingContainerLifecycleManager::new(
                        streaming,
                        self.runtime.clone(),
                        self.http.clone(),
                        self.events.clone(),
                    ))
                }
            }
            DeploymentMode::Process => {
                let spec = template.process.clone().unwrap_or_default();
                let mut process = ProcessConfig::new(provider_id, ports.first().copied().unwrap_or(0));
                process.runtime_path = overrides.runtime_path.clone();
                process.runtime_candidates = spec.runtime_candidates;
                process.min_version = spec.min_version;
                process.package = spec.package;
                process.install_command = spec.install_command;
                process.args = overrides.args.clone().unwrap_or(spec.args);
                process.env = env;
                process.health = spec.http_health.then_some(health);
                DeploymentManager::Process(ProcessLifecycleManager::new(
                    process,
                    self.http.clone(),
                    self.events.clone(),
                ))
            }
            DeploymentMode::Remote => {
                let endpoint = overrides
                    .endpoint
                    .clone()
                    .or_else(|| template.endpoint.clone())
                    .unwrap_or_default();
                let mut remote = RemoteConfig::new(provider_id, endpoint);
                remote.api_key = overrides.api_key.clone().or_else(|| {
                    template
                        .api_key_env
                        .as_deref()
                        .and_then(|var| std::env::var(var).ok())
                        .filter(|key| !key.is_empty())
                });
                remote.auth = match &template.auth_header {
                    Some(header) => AuthScheme::Header(header.clone()),
                    None => AuthScheme::Bearer,
                };
                remote.status_path = health.path;
                DeploymentManager::Remote(RemoteConnectionManager::new(remote, self.events.clone())?)
            }
        };
        Ok(manager)
    }

    pub fn get_instance(&self, provider_id: &str) -> Option<Arc<InstanceHandle>> {
        self.read_instances().get(provider_id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_instances().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Summaries of every tracked instance, ordered by provider id.
    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        let handles: Vec<Arc<InstanceHandle>> = {
            let instances = self.read_instances();
            let mut handles: Vec<_> = instances.values().cloned().collect();
            handles.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
            handles
        };
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.summary().await);
        }
        summaries
    }

    /// Starts a tracked instance and waits until it is ready.
    pub async fn start_instance(&self, provider_id: &str) -> Result<String, DeployError> {
        let handle = self
            .get_instance(provider_id)
            .ok_or_else(|| DeployError::InstanceNotFound(provider_id.to_string()))?;
        handle.lifecycle().start().await
    }

    /// Stops an instance (best effort), frees its ports and volume names,
    /// and forgets it.
    pub async fn remove_provider_instance(&self, provider_id: &str) -> Result<(), DeployError> {
        let handle = self
            .write_instances()
            .remove(provider_id)
            .ok_or_else(|| DeployError::InstanceNotFound(provider_id.to_string()))?;

        handle.lifecycle().stop().await;

        let volumes = self.lock_shared().release(provider_id, &handle.ports);
        if self.config.purge_volumes_on_remove {
            for volume in &volumes {
                if let Err(e) = self.runtime.remove_volume(volume).await {
                    tracing::warn!(provider_id, volume = %volume, error = %e, "failed to remove volume");
                }
            }
        }

        tracing::info!(provider_id, ports = ?handle.ports, "provider instance removed");
        self.events.emit(LifecycleEvent::InstanceRemoved {
            provider_id: provider_id.to_string(),
        });
        Ok(())
    }

    /// Removes every tracked instance.
    pub async fn cleanup(&self) {
        let ids = self.instance_ids();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "removing all provider instances");
        let removals = ids.iter().map(|id| self.remove_provider_instance(id));
        for result in futures_util::future::join_all(removals).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "instance already removed");
            }
        }
    }

    /// Number of host ports currently reserved.
    pub fn allocated_port_count(&self) -> usize {
        self.lock_shared().ports.allocated_count()
    }

    pub fn tracked_volumes(&self, provider_id: &str) -> Vec<String> {
        self.lock_shared().volumes.tracked_volumes(provider_id)
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, SharedResources> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_instances(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<InstanceHandle>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_instances(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<InstanceHandle>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Claims the host ports an instance of `template` needs: none for remote
/// providers, two for streaming containers, one otherwise. Nothing stays
/// claimed on failure.
fn allocate_ports(
    allocator: &mut PortAllocator,
    template: &ProviderTemplate,
    preferred: Option<u16>,
) -> Result<Vec<u16>, DeployError> {
    if !template.mode.uses_host_ports() {
        return Ok(Vec::new());
    }
    let preferred = preferred.or((template.default_port != 0).then_some(template.default_port));
    let primary = allocator.allocate(preferred)?;
    if template.mode != DeploymentMode::StreamingContainer {
        return Ok(vec![primary]);
    }
    match allocator.allocate(Some(primary)) {
        Ok(stream) => Ok(vec![primary, stream]),
        Err(e) => {
            allocator.release(primary);
            Err(e)
        }
    }
}
