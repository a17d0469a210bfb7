//! Externally hosted providers reached over HTTPS.
//!
//! One keep-alive client per scheme is shared by every request to the
//! provider. Requests are retried with capped exponential backoff, but only
//! for server errors and transport failures: a 4xx (auth in particular)
//! fails on the first attempt.

use crate::error::DeployError;
use crate::events::{EventSink, LifecycleEvent};
use crate::lifecycle::ProviderLifecycle;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use voxhost_types::InstanceStatus;

pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 5;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// How the credential is attached to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// A provider-specific header carrying the raw key, e.g. `xi-api-key`.
    Header(String),
}

impl Default for AuthScheme {
    fn default() -> Self {
        Self::Bearer
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub provider_id: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub auth: AuthScheme,
    /// Path probed by connection status checks.
    pub status_path: String,
    pub max_concurrent: usize,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            base_url: base_url.into(),
            api_key: None,
            auth: AuthScheme::default(),
            status_path: "/".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// One request against the remote provider. Bodies are kept as bytes so
/// the request can be replayed on retry.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL.
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

impl RemoteRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            content_type: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            content_type: Some(content_type.into()),
        }
    }
}

/// Result of a one-shot latency probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct Clients {
    plain: reqwest::Client,
    secure: reqwest::Client,
}

#[derive(Debug)]
pub struct RemoteConnectionManager {
    config: RemoteConfig,
    clients: RwLock<Option<Clients>>,
    permits: Arc<Semaphore>,
    events: EventSink,
    last_status: Mutex<Option<ConnectionStatus>>,
}

impl RemoteConnectionManager {
    pub fn new(config: RemoteConfig, events: EventSink) -> Result<Self, DeployError> {
        if config.base_url.trim().is_empty() {
            return Err(DeployError::InvalidConfig(format!(
                "no endpoint configured for {}",
                config.provider_id
            )));
        }
        let plain = build_client(&config, false)?;
        let secure = build_client(&config, true)?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Ok(Self {
            config,
            clients: RwLock::new(Some(Clients { plain, secure })),
            permits,
            events,
            last_status: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.read_clients().is_none()
    }

    /// The most recent connection status probe, if any.
    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.last_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Single unauthenticated probe; `true` only on a 2xx answer.
    pub async fn validate_endpoint(&self, url: &str) -> bool {
        let Ok(client) = self.client_for(url) else {
            return false;
        };
        let request = client.get(url).timeout(self.config.request_timeout);
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url, error = %e, "endpoint validation failed");
                false
            }
        }
    }

    /// Single probe carrying `credential`; `true` only on a 2xx answer, so
    /// 401 and 403 read as a rejected credential.
    pub async fn test_authentication(&self, url: &str, credential: &str) -> bool {
        let Ok(client) = self.client_for(url) else {
            return false;
        };
        let request = self
            .apply_auth(client.get(url), Some(credential))
            .timeout(self.config.request_timeout);
        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    tracing::warn!(provider_id = %self.config.provider_id, status = status.as_u16(), "credential rejected");
                }
                status.is_success()
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "authentication probe failed");
                false
            }
        }
    }

    /// Executes `request` with retry and returns the response body.
    pub async fn request(&self, request: RemoteRequest) -> Result<Vec<u8>, DeployError> {
        let (response, _permit) = self.send_with_retry(&request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| DeployError::ConnectionFailed(format!("failed to read response body: {}", e)))?;
        Ok(body.to_vec())
    }

    /// POSTs `payload` as JSON and decodes the JSON answer.
    pub async fn post_json<T, R>(&self, path: &str, payload: &T) -> Result<R, DeployError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(payload)
            .map_err(|e| DeployError::InvalidConfig(format!("request body is not serializable: {}", e)))?;
        let raw = self
            .request(RemoteRequest::post(path, body, "application/json"))
            .await?;
        serde_json::from_slice(&raw).map_err(|e| DeployError::ApiError {
            status: 200,
            body: format!("undecodable response: {}", e),
        })
    }

    /// Executes `request` with retry and yields the response body as it
    /// arrives.
    ///
    /// The returned stream holds a concurrency permit and the connection
    /// until it is exhausted or dropped.
    pub async fn stream(&self, request: RemoteRequest) -> Result<ResponseStream, DeployError> {
        let (response, permit) = self.send_with_retry(&request).await?;
        Ok(ResponseStream {
            inner: Box::pin(response.bytes_stream().map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| DeployError::ConnectionFailed(e.to_string()))
            })),
            _permit: permit,
        })
    }

    async fn send_with_retry(
        &self,
        request: &RemoteRequest,
    ) -> Result<(reqwest::Response, OwnedSemaphorePermit), DeployError> {
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(request).await {
                Ok(sent) => return Ok(sent),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        provider_id = %self.config.provider_id,
                        path = %request.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "remote request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::error!(provider_id = %self.config.provider_id, attempts = attempt, error = %e, "remote request failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(
        &self,
        request: &RemoteRequest,
    ) -> Result<(reqwest::Response, OwnedSemaphorePermit), DeployError> {
        let url = self.resolve(&request.path);
        let client = self.client_for(&url)?;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DeployError::ManagerClosed)?;

        let mut builder = client
            .request(request.method.clone(), &url)
            .timeout(self.config.request_timeout);
        builder = self.apply_auth(builder, self.config.api_key.as_deref());
        if let Some(content_type) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.map_transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok((response, permit))
    }

    /// One latency probe against the status path. Never fails: problems are
    /// reported through the returned status.
    pub async fn get_connection_status(&self) -> ConnectionStatus {
        let url = self.resolve(&self.config.status_path);
        let started = Instant::now();
        let outcome = match self.client_for(&url) {
            Ok(client) => {
                let request = self
                    .apply_auth(client.get(&url), self.config.api_key.as_deref())
                    .timeout(self.config.request_timeout);
                request.send().await.map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match outcome {
            Ok(resp) if !resp.status().is_server_error() => {
                self.events.emit(LifecycleEvent::LatencyMeasured {
                    endpoint: url.clone(),
                    latency_ms,
                });
                ConnectionStatus {
                    connected: true,
                    latency_ms: Some(latency_ms),
                    last_check: Utc::now(),
                    error: None,
                }
            }
            Ok(resp) => ConnectionStatus {
                connected: false,
                latency_ms: Some(latency_ms),
                last_check: Utc::now(),
                error: Some(format!("HTTP {}", resp.status().as_u16())),
            },
            Err(e) => ConnectionStatus {
                connected: false,
                latency_ms: None,
                last_check: Utc::now(),
                error: Some(e),
            },
        };
        tracing::debug!(
            provider_id = %self.config.provider_id,
            connected = status.connected,
            latency_ms = ?status.latency_ms,
            "remote connection status"
        );
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.clone());
        status
    }

    /// Drops both connection pools and refuses further requests. Calling it
    /// again is a no-op.
    pub fn close(&self) {
        let previous = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.permits.close();
        if previous.is_some() {
            tracing::info!(provider_id = %self.config.provider_id, "remote connection pools closed");
        }
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn client_for(&self, url: &str) -> Result<reqwest::Client, DeployError> {
        let clients = self.read_clients().ok_or(DeployError::ManagerClosed)?;
        if url.starts_with("https://") {
            Ok(clients.secure)
        } else {
            Ok(clients.plain)
        }
    }

    fn read_clients(&self) -> Option<Clients> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn apply_auth(
        &self,
        builder: reqwest::RequestBuilder,
        credential: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match (credential, &self.config.auth) {
            (None, _) => builder,
            (Some(key), AuthScheme::Bearer) => builder.bearer_auth(key),
            (Some(key), AuthScheme::Header(name)) => builder.header(name.as_str(), key),
        }
    }

    fn map_transport_error(&self, e: reqwest::Error) -> DeployError {
        if e.is_timeout() {
            DeployError::RequestTimeout(self.config.request_timeout.as_millis() as u64)
        } else {
            DeployError::ConnectionFailed(e.to_string())
        }
    }
}

fn build_client(config: &RemoteConfig, secure: bool) -> Result<reqwest::Client, DeployError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .tcp_keepalive(TCP_KEEPALIVE)
        .connect_timeout(config.request_timeout)
        .https_only(secure)
        .build()
        .map_err(|e| DeployError::InvalidConfig(format!("failed to build HTTP client: {}", e)))
}

/// Response body chunks of a streaming request.
///
/// Single pass: once exhausted or dropped, the connection and the
/// concurrency permit are released.
pub struct ResponseStream {
    inner: Pin<Box<dyn Stream<Item = Result<Vec<u8>, DeployError>> + Send>>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

impl Stream for ResponseStream {
    type Item = Result<Vec<u8>, DeployError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[async_trait]
impl ProviderLifecycle for RemoteConnectionManager {
    /// Confirms the provider answers; returns its base URL.
    async fn start(&self) -> Result<String, DeployError> {
        if self.is_closed() {
            return Err(DeployError::ManagerClosed);
        }
        let status = self.get_connection_status().await;
        if !status.connected {
            return Err(DeployError::ConnectionFailed(
                status.error.unwrap_or_else(|| "remote provider unreachable".to_string()),
            ));
        }
        Ok(self.config.base_url.clone())
    }

    async fn stop(&self) {
        self.close();
    }

    async fn status(&self) -> InstanceStatus {
        if self.is_closed() {
            return InstanceStatus::Stopped;
        }
        match self.last_status() {
            None => InstanceStatus::NotStarted,
            Some(status) if status.connected => InstanceStatus::Ready,
            Some(_) => InstanceStatus::Error,
        }
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.config.base_url.clone())
    }
}
