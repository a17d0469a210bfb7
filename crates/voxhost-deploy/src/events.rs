//! Lifecycle notifications.
//!
//! Managers receive an [`EventSink`] at construction and publish progress
//! through it. The sink is a broadcast channel owned by whoever wires the
//! orchestrator together; publishing never blocks and is a no-op when
//! nobody subscribed.

use tokio::sync::broadcast;

/// Default capacity of the lifecycle broadcast channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ImagePulled {
        image: String,
        attempts: u32,
    },
    ContainerStarted {
        container_id: String,
        host_ports: Vec<u16>,
    },
    HealthCheckPassed {
        endpoint: String,
        attempts: u32,
    },
    ContainerStopped {
        container_id: String,
    },
    ProcessStarted {
        pid: u32,
    },
    ProcessExited {
        pid: u32,
        exit_code: Option<i32>,
    },
    ProcessStopped {
        pid: u32,
        forced: bool,
    },
    ConnectionPooled {
        session_key: String,
        pool_size: usize,
    },
    ConnectionEvicted {
        session_key: String,
    },
    LatencyMeasured {
        endpoint: String,
        latency_ms: u64,
    },
    InstanceCreated {
        provider_id: String,
        provider_type: String,
    },
    InstanceRemoved {
        provider_id: String,
    },
}

/// Cheaply clonable publisher for [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        // No receivers is not an error for the publisher.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
