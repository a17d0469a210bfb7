use thiserror::Error;

/// Failures surfaced by the deployment layer.
///
/// Transient kinds (see [`DeployError::is_transient`]) are retried inside
/// the managers before they reach a caller; everything else surfaces on the
/// first occurrence.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("container runtime is not installed or not reachable: {0}")]
    RuntimeNotInstalled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to pull image {image} after {attempts} attempts: {last_error}")]
    ImagePullFailure {
        image: String,
        attempts: u32,
        last_error: String,
    },

    #[error("container failed to start: {0}")]
    ContainerStartupFailure(String),

    #[error("could not discover host port for container port {container_port}: {reason}")]
    PortDiscoveryFailure { container_port: u16, reason: String },

    #[error("health check on {endpoint} timed out after {attempts} attempts ({waited_ms} ms): {last_error}")]
    HealthCheckTimeout {
        endpoint: String,
        attempts: u32,
        waited_ms: u64,
        last_error: String,
    },

    #[error("container shutdown failed: {0}")]
    ContainerShutdownFailure(String),

    #[error("no suitable runtime found (tried: {tried})")]
    RuntimeNotFound { tried: String },

    #[error("dependency installation failed: {0}")]
    InstallFailed(String),

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("process {pid} survived SIGKILL")]
    ProcessShutdownFailed { pid: u32 },

    #[error("no free port in range {min}-{max}")]
    PortAllocationExhausted { min: u16, max: u16 },

    #[error("unknown provider type: {0}")]
    UnknownProviderType(String),

    #[error("provider instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("provider instance not found: {0}")]
    InstanceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out after {0} ms")]
    RequestTimeout(u64),

    #[error("API error {status}: {body}")]
    ApiError { status: u16, body: String },

    #[error("remote connection manager is closed")]
    ManagerClosed,

    #[error("data-plane port has not been discovered yet")]
    PortNotAssigned,

    #[error("WebSocket connect to {url} timed out after {timeout_ms} ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    #[error("WebSocket connection error: {0}")]
    WsConnectionError(String),
}

impl DeployError {
    /// Whether this failure is plausibly transient and worth retrying.
    ///
    /// Server-side API errors (5xx), transport failures and timeouts qualify;
    /// client errors (4xx, including auth failures) and every usage error do
    /// not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ApiError { status, .. } => *status >= 500,
            Self::ConnectionFailed(_)
            | Self::RequestTimeout(_)
            | Self::ConnectionTimeout { .. }
            | Self::WsConnectionError(_) => true,
            _ => false,
        }
    }
}
