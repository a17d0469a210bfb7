//! The lifecycle interface shared by every deployment mode.

use crate::error::DeployError;
use async_trait::async_trait;
use voxhost_types::InstanceStatus;

/// Drives one provider instance through start, use and stop, whatever the
/// deployment mode behind it.
#[async_trait]
pub trait ProviderLifecycle: Send + Sync {
    /// Starts the instance and waits until it is ready to serve.
    ///
    /// Returns the mode-specific identifier: a container id, a pid, or the
    /// remote endpoint.
    async fn start(&self) -> Result<String, DeployError>;

    /// Tears the instance down. Failures are logged, never returned, so
    /// callers can always finish their own bookkeeping.
    async fn stop(&self);

    async fn status(&self) -> InstanceStatus;

    /// Base URL of the instance's HTTP surface once known.
    fn endpoint(&self) -> Option<String>;
}
