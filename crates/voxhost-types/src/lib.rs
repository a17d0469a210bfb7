//! Shared data model for the voxhost deployment layer.
//!
//! This crate holds the serializable descriptions that flow between the
//! configuration loader, the orchestrator and its callers: provider
//! templates, per-instance overrides, session parameters for streaming
//! data planes, and the coarse lifecycle status reported for an instance.
//!
//! Nothing here performs I/O. The orchestration logic lives in
//! `voxhost-deploy`.

use serde::{Deserialize, Serialize};

pub mod session;
pub mod template;

pub use session::SessionParams;
pub use template::{
    HealthCheck, InstanceOverrides, ProcessSpec, ProviderTemplate, ResourceLimits,
};

/// How a provider backend is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// A container exposing one HTTP port.
    #[default]
    Container,
    /// A container exposing a health port and a WebSocket data-plane port.
    StreamingContainer,
    /// A native binary spawned as a local OS process.
    Process,
    /// An externally hosted HTTPS/WebSocket API.
    Remote,
}

impl DeploymentMode {
    /// Returns the string label for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::StreamingContainer => "streaming_container",
            Self::Process => "process",
            Self::Remote => "remote",
        }
    }

    /// Whether instances in this mode claim host ports from the allocator.
    pub fn uses_host_ports(self) -> bool {
        !matches!(self, Self::Remote)
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse lifecycle status of a provider instance, independent of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
