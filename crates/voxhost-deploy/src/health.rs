//! Bounded HTTP health polling.

use crate::error::DeployError;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Fixed delay between health probes.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Default overall budget for an instance to become healthy.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Timeout applied to a single probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls `endpoint` until it answers with a 2xx status.
#[derive(Debug, Clone)]
pub struct HealthPoller {
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthPoller {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Probes the endpoint once.
    pub async fn probe(&self, endpoint: &str) -> Result<(), String> {
        match self
            .client
            .get(endpoint)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("HTTP {}", resp.status().as_u16())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Polls until healthy or until `max_wait` elapses.
    ///
    /// The first probe is sent immediately. Returns the number of probes it
    /// took; on timeout fails with `HealthCheckTimeout` carrying the attempt
    /// count and the last observed error.
    pub async fn wait_for_healthy(
        &self,
        endpoint: &str,
        max_wait: Duration,
    ) -> Result<u32, DeployError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut last_error = String::from("no probe completed");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let polling = async {
            loop {
                ticker.tick().await;
                attempts += 1;
                match self.probe(endpoint).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(endpoint, attempt = attempts, error = %e, "health probe failed");
                        last_error = e;
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(max_wait, polling).await;
        match outcome {
            Ok(()) => {
                tracing::info!(endpoint, attempts, "endpoint healthy");
                Ok(attempts)
            }
            Err(_) => Err(DeployError::HealthCheckTimeout {
                endpoint: endpoint.to_string(),
                attempts,
                waited_ms: started.elapsed().as_millis() as u64,
                last_error,
            }),
        }
    }
}
