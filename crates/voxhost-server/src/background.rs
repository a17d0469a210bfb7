//! Background tasks for the voxhost server.

use tokio::sync::broadcast::{self, error::RecvError};
use voxhost_deploy::LifecycleEvent;

/// Logs every lifecycle event until the sink is dropped.
pub async fn log_events(mut rx: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "lifecycle event log fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::InstanceCreated {
            provider_id,
            provider_type,
        } => tracing::info!(provider_id = %provider_id, provider_type = %provider_type, "event: instance created"),
        LifecycleEvent::InstanceRemoved { provider_id } => {
            tracing::info!(provider_id = %provider_id, "event: instance removed")
        }
        LifecycleEvent::ProcessExited { pid, exit_code } => {
            tracing::warn!(pid, exit_code = ?exit_code, "event: process exited")
        }
        other => tracing::debug!(event = ?other, "lifecycle event"),
    }
}
