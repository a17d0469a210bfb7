//! Provider templates and per-instance overrides.
//!
//! A [`ProviderTemplate`] is the immutable set of defaults for one provider
//! type. Callers materialize instances from it and may adjust individual
//! fields through [`InstanceOverrides`]; maps are merged key by key, scalar
//! fields replace the template value.

use crate::DeploymentMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval_ms() -> u64 {
    2_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_health_max_wait_ms() -> u64 {
    60_000
}

/// Health-check parameters for an instance's HTTP control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Path polled on the instance, e.g. `/health`.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Delay between polls.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Timeout applied to each individual probe request.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Overall budget before the instance is declared unhealthy.
    #[serde(default = "default_health_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            max_wait_ms: default_health_max_wait_ms(),
        }
    }
}

/// CPU and memory limits in the runtime's string notation (`"1.5"`, `"4g"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// Launch description for providers that run as a native process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Executable names tried in order when no runtime path is configured.
    #[serde(default)]
    pub runtime_candidates: Vec<String>,
    /// Minimum accepted `(major, minor)` version of the runtime.
    #[serde(default)]
    pub min_version: Option<(u32, u32)>,
    /// Package that must be installed into the runtime before launch.
    #[serde(default)]
    pub package: Option<String>,
    /// Replacement for the default install command.
    #[serde(default)]
    pub install_command: Option<Vec<String>>,
    /// Arguments passed to the runtime. `{port}` is replaced by the
    /// allocated host port.
    #[serde(default)]
    pub args: Vec<String>,
    /// Wait for the template's HTTP health endpoint after spawning, not
    /// just for the process to stay alive.
    #[serde(default)]
    pub http_health: bool,
}

/// Static defaults for one provider type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTemplate {
    /// Key used to look the template up, e.g. `whisper-asr`.
    pub provider_type: String,
    #[serde(default)]
    pub mode: DeploymentMode,
    /// Container image reference for container modes.
    #[serde(default)]
    pub image: Option<String>,
    /// Preferred host port handed to the allocator.
    #[serde(default)]
    pub default_port: u16,
    /// Port the service listens on inside the container.
    #[serde(default)]
    pub internal_port: u16,
    /// Internal WebSocket data-plane port for streaming containers.
    #[serde(default)]
    pub stream_port: Option<u16>,
    #[serde(default)]
    pub health: HealthCheck,
    /// Logical mount name to container path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Whether the provider can make use of a GPU.
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub process: Option<ProcessSpec>,
    /// Base URL for remote providers.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Header carrying the API key for remote providers; `None` means
    /// `Authorization: Bearer`.
    #[serde(default)]
    pub auth_header: Option<String>,
    /// Environment variable the API key is read from when no override
    /// supplies one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderTemplate {
    /// Creates a template with only the type and mode set.
    pub fn new(provider_type: impl Into<String>, mode: DeploymentMode) -> Self {
        Self {
            provider_type: provider_type.into(),
            mode,
            image: None,
            default_port: 0,
            internal_port: 0,
            stream_port: None,
            health: HealthCheck::default(),
            volumes: BTreeMap::new(),
            env: BTreeMap::new(),
            gpu: false,
            limits: ResourceLimits::default(),
            process: None,
            endpoint: None,
            auth_header: None,
            api_key_env: None,
        }
    }
}

/// Caller adjustments applied on top of a template when an instance is
/// created. `None` and empty maps leave the template value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceOverrides {
    #[serde(default)]
    pub image: Option<String>,
    /// Preferred host port; the allocator falls back to the next free one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub health: Option<HealthCheck>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub gpu: Option<bool>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Explicit runtime executable for process mode; skips detection.
    #[serde(default)]
    pub runtime_path: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
}
