//! Container lifecycle management for containerized providers.
//!
//! A [`ContainerLifecycleManager`] owns at most one container and walks it
//! through `NotStarted → Pulling → Starting → PortDiscovery →
//! HealthChecking → Ready`, then `Stopping → Stopped`. Any step may land in
//! `Error`, which leaves the container id recorded so teardown can still
//! reach it.
//!
//! Host ports are never chosen by this manager: every internal port is
//! published on an OS-assigned loopback port, and the runtime is asked for
//! the real mapping after start. This lets any number of instances of the
//! same provider type coexist.

use crate::error::DeployError;
use crate::events::{EventSink, LifecycleEvent};
use crate::health::HealthPoller;
use crate::lifecycle::ProviderLifecycle;
use crate::limits::{parse_cpus, parse_memory};
use crate::retry::RetryPolicy;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, PROVIDER_LABEL};
use crate::volumes::encode_part;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voxhost_types::{HealthCheck, InstanceStatus, ResourceLimits};

/// Default number of image pull attempts.
pub const DEFAULT_PULL_ATTEMPTS: u32 = 3;

/// Grace period given to a container before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Port discovery is retried this many times before giving up.
const PORT_DISCOVERY_ATTEMPTS: u32 = 5;
const PORT_DISCOVERY_DELAY: Duration = Duration::from_millis(200);

/// Resolved configuration for one containerized instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerConfig {
    pub provider_id: String,
    pub image: String,
    /// Port the service (and its health endpoint) listens on in the container.
    pub internal_port: u16,
    /// Further internal ports to publish, e.g. a streaming data plane.
    pub extra_ports: Vec<u16>,
    pub health: HealthCheck,
    pub env: BTreeMap<String, String>,
    /// Volume name -> container path.
    pub volumes: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub gpu: bool,
    pub pull_attempts: u32,
    pub stop_grace: Duration,
}

impl ContainerConfig {
    pub fn new(provider_id: impl Into<String>, image: impl Into<String>, internal_port: u16) -> Self {
        Self {
            provider_id: provider_id.into(),
            image: image.into(),
            internal_port,
            extra_ports: Vec::new(),
            health: HealthCheck::default(),
            env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            limits: ResourceLimits::default(),
            gpu: false,
            pull_attempts: DEFAULT_PULL_ATTEMPTS,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Deterministic container name for this instance.
    pub fn container_name(&self) -> String {
        format!("voxhost_{}", encode_part(&self.provider_id))
    }

    fn published_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.internal_port];
        for port in &self.extra_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }

    fn validate(&self) -> Result<(), DeployError> {
        if self.provider_id.trim().is_empty() {
            return Err(DeployError::InvalidConfig("provider id is empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(DeployError::InvalidConfig(format!(
                "no image configured for {}",
                self.provider_id
            )));
        }
        if self.internal_port == 0 || self.extra_ports.contains(&0) {
            return Err(DeployError::InvalidConfig(format!(
                "no internal port configured for {}",
                self.provider_id
            )));
        }
        Ok(())
    }

    fn to_spec(&self) -> Result<ContainerSpec, DeployError> {
        let nano_cpus = self.limits.cpus.as_deref().map(parse_cpus).transpose()?;
        let memory_bytes = self.limits.memory.as_deref().map(parse_memory).transpose()?;
        let mut labels = BTreeMap::new();
        labels.insert(PROVIDER_LABEL.to_string(), self.provider_id.clone());
        Ok(ContainerSpec {
            name: self.container_name(),
            image: self.image.clone(),
            env: self.env.clone(),
            ports: self.published_ports(),
            binds: self.volumes.clone(),
            nano_cpus,
            memory_bytes,
            gpu: self.gpu,
            labels,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    NotStarted,
    Pulling,
    Starting,
    PortDiscovery,
    HealthChecking,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl ContainerPhase {
    fn instance_status(self) -> InstanceStatus {
        match self {
            Self::NotStarted => InstanceStatus::NotStarted,
            Self::Pulling | Self::Starting | Self::PortDiscovery | Self::HealthChecking => {
                InstanceStatus::Starting
            }
            Self::Ready => InstanceStatus::Ready,
            Self::Stopping => InstanceStatus::Stopping,
            Self::Stopped => InstanceStatus::Stopped,
            Self::Error => InstanceStatus::Error,
        }
    }
}

/// Runtime-observed state of the managed container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub container_id: Option<String>,
    /// Internal port -> discovered host port.
    pub host_ports: HashMap<u16, u16>,
    pub phase: ContainerPhase,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_health_ok: Option<bool>,
    pub last_error: Option<String>,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            container_id: None,
            host_ports: HashMap::new(),
            phase: ContainerPhase::NotStarted,
            last_health_check: None,
            last_health_ok: None,
            last_error: None,
        }
    }
}

/// Status of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug)]
pub struct ContainerLifecycleManager {
    config: ContainerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    poller: HealthPoller,
    events: EventSink,
    pull_backoff: RetryPolicy,
    state: Mutex<ContainerState>,
    /// Serializes start/stop so two callers cannot launch twice.
    transition: tokio::sync::Mutex<()>,
}

impl ContainerLifecycleManager {
    pub fn new(
        config: ContainerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        http: reqwest::Client,
        events: EventSink,
    ) -> Self {
        let poller = HealthPoller::new(http)
            .with_interval(Duration::from_millis(config.health.interval_ms))
            .with_probe_timeout(Duration::from_millis(config.health.timeout_ms));
        let pull_backoff = RetryPolicy::image_pull(config.pull_attempts);
        Self {
            config,
            runtime,
            poller,
            events,
            pull_backoff,
            state: Mutex::new(ContainerState::default()),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Overrides the delay schedule used between pull attempts.
    pub fn with_pull_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.pull_backoff.base_delay = base_delay;
        self.pull_backoff.max_delay = max_delay;
        self
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn state(&self) -> ContainerState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> ContainerPhase {
        self.lock_state().phase
    }

    pub fn container_id(&self) -> Option<String> {
        self.lock_state().container_id.clone()
    }

    /// Discovered host port for an internal port.
    pub fn host_port(&self, internal_port: u16) -> Option<u16> {
        self.lock_state().host_ports.get(&internal_port).copied()
    }

    /// Base URL of the primary HTTP surface.
    pub fn base_url(&self) -> Option<String> {
        self.host_port(self.config.internal_port)
            .map(|port| format!("http://127.0.0.1:{}", port))
    }

    pub fn health_url(&self) -> Option<String> {
        self.base_url()
            .map(|base| format!("{}{}", base, self.config.health.path))
    }

    /// Probes whether the container runtime answers. Never fails.
    pub async fn check_runtime_available(&self) -> bool {
        match self.runtime.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "container runtime not available");
                false
            }
        }
    }

    /// Pulls `image`, retrying with capped exponential backoff.
    ///
    /// Returns the number of attempts used.
    pub async fn pull_image(&self, image: &str, max_retries: u32) -> Result<u32, DeployError> {
        let policy = RetryPolicy {
            max_attempts: max_retries.max(1),
            ..self.pull_backoff
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.runtime.pull_image(image).await {
                Ok(()) => {
                    tracing::info!(image, attempt, "image pulled");
                    self.events.emit(LifecycleEvent::ImagePulled {
                        image: image.to_string(),
                        attempts: attempt,
                    });
                    return Ok(attempt);
                }
                Err(e) if policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        image,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "image pull failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(DeployError::ImagePullFailure {
                        image: image.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Launches the container and waits until its health endpoint answers.
    ///
    /// Returns the container id. A manager that is already `Ready` returns
    /// the running container's id without relaunching.
    pub async fn start_container(&self) -> Result<String, DeployError> {
        let _guard = self.transition.lock().await;
        {
            let state = self.lock_state();
            if state.phase == ContainerPhase::Ready {
                if let Some(id) = &state.container_id {
                    return Ok(id.clone());
                }
            }
        }

        match self.launch().await {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::error!(provider_id = %self.config.provider_id, error = %e, "container start failed");
                let mut state = self.lock_state();
                state.phase = ContainerPhase::Error;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<String, DeployError> {
        self.config.validate()?;
        let spec = self.config.to_spec()?;

        if let Err(e) = self.runtime.ping().await {
            return Err(DeployError::RuntimeNotInstalled(e.to_string()));
        }

        self.set_phase(ContainerPhase::Pulling);
        self.pull_image(&self.config.image, self.config.pull_attempts)
            .await?;

        self.set_phase(ContainerPhase::Starting);
        for volume in spec.binds.keys() {
            if let Err(e) = self.runtime.create_volume(volume).await {
                tracing::debug!(volume = %volume, error = %e, "volume create failed, runtime will create on bind");
            }
        }
        // A container left behind by an earlier run would block the name.
        match self.runtime.remove(&spec.name).await {
            Ok(()) => tracing::info!(name = %spec.name, "removed stale container"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => tracing::debug!(name = %spec.name, error = %e, "stale container check failed"),
        }

        let container_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| DeployError::ContainerStartupFailure(e.to_string()))?;
        if let Err(e) = self.runtime.start(&container_id).await {
            self.discard(&container_id).await;
            return Err(DeployError::ContainerStartupFailure(e.to_string()));
        }
        self.lock_state().container_id = Some(container_id.clone());

        let inspection = self
            .runtime
            .inspect(&container_id)
            .await
            .map_err(|e| DeployError::ContainerStartupFailure(e.to_string()))?;
        if !inspection.running {
            return Err(DeployError::ContainerStartupFailure(format!(
                "container {} is {} instead of running",
                container_id,
                if inspection.status.is_empty() {
                    "not running"
                } else {
                    inspection.status.as_str()
                }
            )));
        }

        self.set_phase(ContainerPhase::PortDiscovery);
        let host_ports = self.discover_ports(&container_id, &spec.ports).await?;
        self.lock_state().host_ports = host_ports.clone();

        let mut published: Vec<u16> = spec.ports.iter().filter_map(|p| host_ports.get(p).copied()).collect();
        published.dedup();
        tracing::info!(
            provider_id = %self.config.provider_id,
            container_id = %container_id,
            host_ports = ?published,
            "container started"
        );
        self.events.emit(LifecycleEvent::ContainerStarted {
            container_id: container_id.clone(),
            host_ports: published,
        });

        self.set_phase(ContainerPhase::HealthChecking);
        let endpoint = self
            .health_url()
            .ok_or(DeployError::PortDiscoveryFailure {
                container_port: self.config.internal_port,
                reason: "primary port missing after discovery".to_string(),
            })?;
        self.wait_for_healthy(
            &endpoint,
            Duration::from_millis(self.config.health.max_wait_ms),
        )
        .await?;

        self.set_phase(ContainerPhase::Ready);
        Ok(container_id)
    }

    /// Removes a container that was created but never started.
    async fn discard(&self, container_id: &str) {
        match self.runtime.remove(container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {
                tracing::debug!(container_id, "removed container that failed to start")
            }
            Err(e) => {
                tracing::warn!(container_id, error = %e, "failed to remove unstarted container (may require manual cleanup)")
            }
        }
    }

    /// Asks the runtime for the host port of every published internal port.
    async fn discover_ports(
        &self,
        container_id: &str,
        ports: &[u16],
    ) -> Result<HashMap<u16, u16>, DeployError> {
        let mut last_reason = String::new();
        for attempt in 1..=PORT_DISCOVERY_ATTEMPTS {
            match self.runtime.inspect(container_id).await {
                Ok(inspection) => {
                    match ports.iter().find(|p| !inspection.ports.contains_key(p)) {
                        None => {
                            return Ok(ports
                                .iter()
                                .filter_map(|p| inspection.ports.get(p).map(|h| (*p, *h)))
                                .collect())
                        }
                        Some(missing) => {
                            last_reason = format!("no host binding for port {}", missing);
                        }
                    }
                }
                Err(e) => last_reason = e.to_string(),
            }
            if attempt < PORT_DISCOVERY_ATTEMPTS {
                tokio::time::sleep(PORT_DISCOVERY_DELAY).await;
            }
        }

        let missing = ports.first().copied().unwrap_or(self.config.internal_port);
        Err(DeployError::PortDiscoveryFailure {
            container_port: missing,
            reason: last_reason,
        })
    }

    /// Polls `endpoint` until it answers 2xx or `max_wait` elapses.
    pub async fn wait_for_healthy(&self, endpoint: &str, max_wait: Duration) -> Result<u32, DeployError> {
        let result = self.poller.wait_for_healthy(endpoint, max_wait).await;
        {
            let mut state = self.lock_state();
            state.last_health_check = Some(Utc::now());
            state.last_health_ok = Some(result.is_ok());
        }
        if let Ok(attempts) = result {
            self.events.emit(LifecycleEvent::HealthCheckPassed {
                endpoint: endpoint.to_string(),
                attempts,
            });
        }
        result
    }

    /// Stops and removes a container.
    ///
    /// A failed graceful stop escalates to a kill; removal is always
    /// attempted. Failures are logged and swallowed: from this process's
    /// point of view the container is gone afterwards.
    pub async fn stop_container(&self, container_id: &str) {
        self.set_phase(ContainerPhase::Stopping);

        if let Err(e) = self.try_stop(container_id).await {
            tracing::warn!(container_id, error = %e, "container shutdown incomplete");
        }

        match self.runtime.remove(container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(container_id, error = %e, "failed to remove container (may require manual cleanup)")
            }
        }

        {
            let mut state = self.lock_state();
            if state.container_id.as_deref() == Some(container_id) {
                state.container_id = None;
                state.host_ports.clear();
            }
            state.phase = ContainerPhase::Stopped;
        }
        tracing::info!(container_id, "container stopped");
        self.events.emit(LifecycleEvent::ContainerStopped {
            container_id: container_id.to_string(),
        });
    }

    async fn try_stop(&self, container_id: &str) -> Result<(), DeployError> {
        let stop_error = match self.runtime.stop(container_id, self.config.stop_grace).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(container_id, error = %stop_error, "graceful stop failed, killing container");
        match self.runtime.kill(container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(kill_error) => Err(DeployError::ContainerShutdownFailure(format!(
                "stop: {}; kill: {}",
                stop_error, kill_error
            ))),
        }
    }

    /// Reports the runtime's view of a container. Unknown containers count
    /// as stopped.
    pub async fn get_container_status(&self, container_id: &str) -> ContainerStatus {
        match self.runtime.inspect(container_id).await {
            Ok(inspection) if inspection.running => ContainerStatus::Running,
            Ok(inspection) if inspection.status == "dead" => ContainerStatus::Error,
            Ok(_) | Err(RuntimeError::NotFound(_)) => ContainerStatus::Stopped,
            Err(e) => {
                tracing::debug!(container_id, error = %e, "container status unavailable");
                ContainerStatus::Error
            }
        }
    }

    fn set_phase(&self, phase: ContainerPhase) {
        tracing::debug!(provider_id = %self.config.provider_id, phase = ?phase, "container phase");
        self.lock_state().phase = phase;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProviderLifecycle for ContainerLifecycleManager {
    async fn start(&self) -> Result<String, DeployError> {
        self.start_container().await
    }

    async fn stop(&self) {
        let _guard = self.transition.lock().await;
        match self.container_id() {
            Some(id) => self.stop_container(&id).await,
            None => self.set_phase(ContainerPhase::Stopped),
        }
    }

    async fn status(&self) -> InstanceStatus {
        let (phase, container_id) = {
            let state = self.lock_state();
            (state.phase, state.container_id.clone())
        };
        // A ready container that died underneath us is an error.
        if let (ContainerPhase::Ready, Some(id)) = (phase, container_id) {
            if self.get_container_status(&id).await != ContainerStatus::Running {
                return InstanceStatus::Error;
            }
        }
        phase.instance_status()
    }

    fn endpoint(&self) -> Option<String> {
        self.base_url()
    }
}
