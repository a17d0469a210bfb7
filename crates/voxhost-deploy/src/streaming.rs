//! Streaming-container variant: a control plane plus a WebSocket data plane.
//!
//! The container publishes two internal ports, the HTTP health surface and
//! the WebSocket endpoint clients stream audio into. Both host ports are
//! OS-assigned and discovered after start; the instance is only ready once
//! both are known and the health surface answers.
//!
//! Open data-plane connections are pooled per session key (model and
//! language) so a finished session's socket can serve the next one.

use crate::container::{ContainerConfig, ContainerLifecycleManager};
use crate::error::DeployError;
use crate::events::{EventSink, LifecycleEvent};
use crate::lifecycle::ProviderLifecycle;
use crate::pool::{ConnectionPool, PoolableConnection, PooledConnection, DEFAULT_MAX_POOL_SIZE};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;
use voxhost_types::{InstanceStatus, SessionParams};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_PATH: &str = "/v1/listen";

/// Fixed audio and turn-detection parameters the data plane expects on
/// every connection URL.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProtocol {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub punctuate: bool,
    pub interim_results: bool,
    /// End-of-turn confidence threshold.
    pub eot_threshold: f32,
    /// Silence after which a turn ends regardless of confidence.
    pub eot_timeout_ms: u32,
}

impl Default for StreamProtocol {
    fn default() -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate: 16_000,
            channels: 1,
            punctuate: true,
            interim_results: true,
            eot_threshold: 0.7,
            eot_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub container: ContainerConfig,
    /// Internal WebSocket port.
    pub stream_port: u16,
    pub stream_path: String,
    pub protocol: StreamProtocol,
    pub max_pool_size: usize,
    pub connect_timeout: Duration,
    pub max_idle: Option<Duration>,
}

impl StreamingConfig {
    pub fn new(container: ContainerConfig, stream_port: u16) -> Self {
        Self {
            container,
            stream_port,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            protocol: StreamProtocol::default(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_idle: None,
        }
    }
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One data-plane WebSocket.
#[derive(Debug)]
pub struct WsConnection {
    stream: WsStream,
    open: bool,
}

impl WsConnection {
    pub fn new(stream: WsStream) -> Self {
        Self { stream, open: true }
    }

    pub async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), DeployError> {
        self.send(Message::binary(chunk)).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), DeployError> {
        self.send(Message::text(text.into())).await
    }

    async fn send(&mut self, message: Message) -> Result<(), DeployError> {
        if let Err(e) = self.stream.send(message).await {
            self.open = false;
            return Err(DeployError::WsConnectionError(e.to_string()));
        }
        Ok(())
    }

    /// Next message from the data plane; `None` once the peer is gone.
    pub async fn next_message(&mut self) -> Option<Result<Message, DeployError>> {
        match self.stream.next().await {
            Some(Ok(Message::Close(_))) | None => {
                self.open = false;
                None
            }
            Some(Ok(message)) => Some(Ok(message)),
            Some(Err(e)) => {
                self.open = false;
                Some(Err(DeployError::WsConnectionError(e.to_string())))
            }
        }
    }

    pub async fn close(mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!(error = %e, "websocket close failed");
            }
        }
    }
}

impl PoolableConnection for WsConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    /// Drains whatever is already buffered on the socket. A close, an error
    /// or end of stream marks the connection dead. Data frames on an idle
    /// connection belong to an earlier session, so they retire it too.
    fn check_alive(&mut self) -> bool {
        while self.open {
            match self.stream.next().now_or_never() {
                None => break,
                Some(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)))) => {}
                Some(Some(Ok(Message::Close(_)))) | Some(None) => {
                    tracing::debug!("data plane closed idle connection");
                    self.open = false;
                }
                Some(Some(Ok(_))) => {
                    tracing::debug!("unsolicited data on idle connection");
                    self.open = false;
                }
                Some(Some(Err(e))) => {
                    tracing::debug!(error = %e, "idle connection failed");
                    self.open = false;
                }
            }
        }
        self.open
    }
}

/// A pooled data-plane connection handed to callers.
pub type StreamConnection = PooledConnection<WsConnection>;

#[derive(Debug)]
pub struct StreamingContainerLifecycleManager {
    config: StreamingConfig,
    container: ContainerLifecycleManager,
    pool: Mutex<ConnectionPool<WsConnection>>,
    events: EventSink,
}

impl StreamingContainerLifecycleManager {
    pub fn new(
        mut config: StreamingConfig,
        runtime: Arc<dyn ContainerRuntime>,
        http: reqwest::Client,
        events: EventSink,
    ) -> Self {
        if !config.container.extra_ports.contains(&config.stream_port) {
            config.container.extra_ports.push(config.stream_port);
        }
        let container =
            ContainerLifecycleManager::new(config.container.clone(), runtime, http, events.clone());
        let mut pool = ConnectionPool::new(config.max_pool_size);
        if let Some(max_idle) = config.max_idle {
            pool = pool.with_max_idle(max_idle);
        }
        Self {
            config,
            container,
            pool: Mutex::new(pool),
            events,
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// The underlying container manager (control plane).
    pub fn container(&self) -> &ContainerLifecycleManager {
        &self.container
    }

    pub fn stream_host_port(&self) -> Option<u16> {
        self.container.host_port(self.config.stream_port)
    }

    /// Starts the container; ready only once both ports are discovered and
    /// the health surface answers.
    pub async fn start_container(&self) -> Result<String, DeployError> {
        let container_id = self.container.start_container().await?;
        if self.stream_host_port().is_none() {
            return Err(DeployError::PortNotAssigned);
        }
        Ok(container_id)
    }

    /// Composes the data-plane URL for a session.
    pub fn build_connection_url(&self, session: &SessionParams) -> Result<String, DeployError> {
        let port = self.stream_host_port().ok_or(DeployError::PortNotAssigned)?;
        let mut url = Url::parse(&format!("ws://127.0.0.1:{}", port))
            .map_err(|e| DeployError::InvalidConfig(e.to_string()))?;
        url.set_path(&self.config.stream_path);

        let protocol = &self.config.protocol;
        url.query_pairs_mut()
            .append_pair("encoding", &protocol.encoding)
            .append_pair("sample_rate", &protocol.sample_rate.to_string())
            .append_pair("channels", &protocol.channels.to_string())
            .append_pair("punctuate", &protocol.punctuate.to_string())
            .append_pair("interim_results", &protocol.interim_results.to_string())
            .append_pair("eot_threshold", &protocol.eot_threshold.to_string())
            .append_pair("eot_timeout_ms", &protocol.eot_timeout_ms.to_string())
            .append_pair("model", &session.model)
            .append_pair("language", &session.language);

        Ok(url.into())
    }

    /// Returns a pooled connection for the session or opens a new one.
    pub async fn acquire_connection(
        &self,
        session: &SessionParams,
    ) -> Result<StreamConnection, DeployError> {
        let key = session.pool_key();
        let checkout = self.lock_pool().checkout(&key);

        for stale in checkout.evicted {
            tracing::debug!(session_key = %key, "evicting dead pooled connection");
            self.events.emit(LifecycleEvent::ConnectionEvicted {
                session_key: key.clone(),
            });
            stale.into_inner().close().await;
        }
        if let Some(conn) = checkout.reused {
            tracing::debug!(session_key = %key, "reusing pooled connection");
            return Ok(conn);
        }

        let url = self.build_connection_url(session)?;
        let timeout_ms = self.config.connect_timeout.as_millis() as u64;
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| DeployError::ConnectionTimeout {
                url: url.clone(),
                timeout_ms,
            })?
            .map_err(|e| DeployError::WsConnectionError(e.to_string()))?;

        tracing::info!(session_key = %key, "opened data-plane connection");
        Ok(PooledConnection::new(WsConnection::new(stream), key))
    }

    /// Gives a connection back for reuse under the session's key. Closed,
    /// unhealthy or surplus connections are closed instead of pooled.
    pub async fn release_connection(&self, conn: StreamConnection, session: &SessionParams) {
        let key = session.pool_key();
        let outcome = self.lock_pool().checkin(&key, conn);
        match outcome {
            Ok(pool_size) => {
                self.events.emit(LifecycleEvent::ConnectionPooled {
                    session_key: key,
                    pool_size,
                });
            }
            Err(rejected) => {
                tracing::debug!(session_key = %key, "closing connection instead of pooling it");
                rejected.into_inner().close().await;
            }
        }
    }

    pub fn pool_size(&self, session: &SessionParams) -> usize {
        self.lock_pool().size(&session.pool_key())
    }

    pub fn pool_stats(&self) -> HashMap<String, usize> {
        self.lock_pool().stats()
    }

    /// Closes every pooled connection, then stops the container.
    pub async fn cleanup(&self) {
        let drained = self.lock_pool().drain();
        let closed = drained.len();
        for conn in drained {
            conn.into_inner().close().await;
        }
        tracing::info!(closed, "closed pooled data-plane connections");
        ProviderLifecycle::stop(&self.container).await;
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, ConnectionPool<WsConnection>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProviderLifecycle for StreamingContainerLifecycleManager {
    async fn start(&self) -> Result<String, DeployError> {
        self.start_container().await
    }

    async fn stop(&self) {
        self.cleanup().await;
    }

    async fn status(&self) -> InstanceStatus {
        self.container.status().await
    }

    fn endpoint(&self) -> Option<String> {
        self.container.base_url()
    }
}
