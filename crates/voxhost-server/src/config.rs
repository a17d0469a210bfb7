//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use voxhost_deploy::DeployConfig;
use voxhost_types::{InstanceOverrides, ProviderTemplate};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Port range, volume naming and teardown behaviour.
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Extra provider templates. An entry whose `provider_type` matches a
    /// built-in replaces it.
    #[serde(default)]
    pub templates: Vec<ProviderTemplate>,

    /// Instances created and started at boot.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxhost_deploy=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// One `[[instances]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub provider_type: String,
    #[serde(default)]
    pub overrides: InstanceOverrides,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    7700
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXHOST_HOST` overrides `server.host`
/// - `VOXHOST_PORT` overrides `server.port`
/// - `VOXHOST_PORT_MIN` / `VOXHOST_PORT_MAX` override the deploy port range
/// - `VOXHOST_VOLUME_BASE` overrides `deploy.volume_base_name`
/// - `VOXHOST_LOG_LEVEL` overrides `logging.level`
/// - `VOXHOST_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `VOXHOST_*` overrides read through `lookup`. Values that do not
/// parse are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("VOXHOST_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("VOXHOST_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(min) = lookup("VOXHOST_PORT_MIN") {
        if let Ok(parsed) = min.parse() {
            config.deploy.port_min = parsed;
        }
    }
    if let Some(max) = lookup("VOXHOST_PORT_MAX") {
        if let Ok(parsed) = max.parse() {
            config.deploy.port_max = parsed;
        }
    }
    if let Some(base) = lookup("VOXHOST_VOLUME_BASE") {
        config.deploy.volume_base_name = base;
    }
    if let Some(level) = lookup("VOXHOST_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("VOXHOST_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
