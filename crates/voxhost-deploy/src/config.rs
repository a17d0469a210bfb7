use crate::container::DEFAULT_PULL_ATTEMPTS;
use crate::ports::{DEFAULT_PORT_MAX, DEFAULT_PORT_MIN};
use crate::volumes::DEFAULT_VOLUME_BASE;
use serde::{Deserialize, Serialize};

fn default_port_min() -> u16 {
    DEFAULT_PORT_MIN
}

fn default_port_max() -> u16 {
    DEFAULT_PORT_MAX
}

fn default_volume_base_name() -> String {
    DEFAULT_VOLUME_BASE.to_string()
}

fn default_pull_attempts() -> u32 {
    DEFAULT_PULL_ATTEMPTS
}

/// Orchestrator-wide settings (`[deploy]` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Lowest host port handed out by the allocator.
    #[serde(default = "default_port_min")]
    pub port_min: u16,
    /// Highest host port handed out by the allocator (inclusive).
    #[serde(default = "default_port_max")]
    pub port_max: u16,
    /// Prefix of every volume name.
    #[serde(default = "default_volume_base_name")]
    pub volume_base_name: String,
    /// Also delete an instance's volumes from the runtime on removal.
    /// Otherwise they are only forgotten so model caches survive.
    #[serde(default)]
    pub purge_volumes_on_remove: bool,
    /// Skip ports another program currently holds on the loopback.
    #[serde(default)]
    pub probe_host_ports: bool,
    #[serde(default = "default_pull_attempts")]
    pub pull_attempts: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port_min: default_port_min(),
            port_max: default_port_max(),
            volume_base_name: default_volume_base_name(),
            purge_volumes_on_remove: false,
            probe_host_ports: false,
            pull_attempts: default_pull_attempts(),
        }
    }
}
