//! Deployment orchestration for voice providers.
//!
//! Gives a host application a running speech-to-text or text-to-speech
//! backend without it having to care whether that backend is a local
//! container, a streaming container with a WebSocket data plane, a native
//! process, or a hosted API.
//!
//! [`DeploymentOrchestrator`] is the entry point: it resolves provider
//! templates, reserves host ports and volume names, and builds one
//! lifecycle manager per instance. Each manager implements
//! [`ProviderLifecycle`], so callers can start, probe and stop any instance
//! the same way and reach for the mode-specific API when they need it.

pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod limits;
pub mod orchestrator;
pub mod pool;
pub mod ports;
pub mod process;
pub mod remote;
pub mod retry;
pub mod runtime;
pub mod streaming;
pub mod templates;
pub mod volumes;

pub use config::DeployConfig;
pub use container::{ContainerConfig, ContainerLifecycleManager, ContainerPhase, ContainerState, ContainerStatus};
pub use error::DeployError;
pub use events::{EventSink, LifecycleEvent};
pub use health::HealthPoller;
pub use lifecycle::ProviderLifecycle;
pub use orchestrator::{DeploymentManager, DeploymentOrchestrator, InstanceHandle, InstanceSummary};
pub use pool::{ConnectionPool, PoolableConnection, PooledConnection};
pub use ports::PortAllocator;
pub use process::{ProcessConfig, ProcessLifecycleManager, ProcessPhase, ProcessStatus};
pub use remote::{AuthScheme, ConnectionStatus, RemoteConfig, RemoteConnectionManager, RemoteRequest, ResponseStream};
pub use retry::RetryPolicy;
pub use runtime::{ContainerInspection, ContainerRuntime, ContainerSpec, DockerRuntime, RuntimeError};
pub use streaming::{StreamConnection, StreamProtocol, StreamingConfig, StreamingContainerLifecycleManager, WsConnection};
pub use templates::TemplateRegistry;
pub use volumes::VolumeManager;
