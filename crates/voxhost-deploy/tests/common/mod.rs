#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::Response,
    routing::{any, get},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use voxhost_deploy::{ContainerInspection, ContainerRuntime, ContainerSpec, RuntimeError};

/// In-memory container runtime that records every call.
#[derive(Debug, Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    /// Number of pulls that fail before one succeeds.
    pub pull_failures: AtomicU32,
    pub pull_attempts: AtomicU32,
    pub unavailable: AtomicBool,
    /// Report created containers as exited instead of running.
    pub exits_immediately: AtomicBool,
    pub start_fails: AtomicBool,
    pub stop_fails: AtomicBool,
    pub kill_fails: AtomicBool,
    /// Internal port -> host port reported by inspect.
    host_ports: Mutex<HashMap<u16, u16>>,
    containers: Mutex<HashMap<String, bool>>,
    next_id: AtomicUsize,
    last_spec: Mutex<Option<ContainerSpec>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Maps every listed internal port onto `host_port`.
    pub fn with_host_port(internal_ports: &[u16], host_port: u16) -> Arc<Self> {
        let runtime = Self::default();
        {
            let mut ports = runtime.host_ports.lock().unwrap();
            for internal in internal_ports {
                ports.insert(*internal, host_port);
            }
        }
        Arc::new(runtime)
    }

    pub fn map_port(&self, internal_port: u16, host_port: u16) {
        self.host_ports
            .lock()
            .unwrap()
            .insert(internal_port, host_port);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .count()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    pub fn running_containers(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|running| **running)
            .count()
    }

    /// Containers the runtime still knows about, running or not.
    pub fn known_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.record("ping".to_string());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon not running".to_string()));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {}", image));
        self.pull_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.pull_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pull_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Api("registry timeout".to_string()));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create {}", spec.name));
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(id.clone(), false);
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {}", id));
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("port is already allocated".to_string()));
        }
        let running = !self.exits_immediately.load(Ordering::SeqCst);
        match self.containers.lock().unwrap().get_mut(id) {
            Some(state) => {
                *state = running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError> {
        self.record(format!("inspect {}", id));
        let running = *self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerInspection {
            running,
            status: if running { "running" } else { "exited" }.to_string(),
            ports: if running {
                self.host_ports.lock().unwrap().clone()
            } else {
                HashMap::new()
            },
        })
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {}", id));
        if self.stop_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("stop timed out".to_string()));
        }
        match self.containers.lock().unwrap().get_mut(id) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("kill {}", id));
        if self.kill_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("kill refused".to_string()));
        }
        if let Some(running) = self.containers.lock().unwrap().get_mut(id) {
            *running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove {}", id));
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("create_volume {}", name));
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove_volume {}", name));
        Ok(())
    }
}

/// A local HTTP server answering `path` with a scripted status sequence;
/// the last status repeats once the script runs out.
#[derive(Debug, Clone)]
pub struct ScriptedServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl ScriptedServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

#[derive(Clone)]
struct Script {
    statuses: Arc<Vec<u16>>,
    hits: Arc<AtomicUsize>,
}

async fn scripted(State(script): State<Script>) -> (StatusCode, String) {
    let hit = script.hits.fetch_add(1, Ordering::SeqCst);
    let code = script
        .statuses
        .get(hit)
        .or_else(|| script.statuses.last())
        .copied()
        .unwrap_or(200);
    let status = StatusCode::from_u16(code).unwrap();
    (status, format!("{{\"hit\":{}}}", hit + 1))
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            if socket.send(msg).await.is_err() {
                break;
            }
        }
    })
}

/// Accepts the upgrade and drops the socket without a close frame.
async fn ws_hangup(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| async move {
        drop(socket);
    })
}

/// Serves `path` with the scripted statuses, `/v1/listen` as a WebSocket
/// echo endpoint and `/v1/hangup` as one that hangs up after the upgrade.
pub async fn spawn_scripted_server(path: &str, statuses: Vec<u16>) -> ScriptedServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let script = Script {
        statuses: Arc::new(statuses),
        hits: hits.clone(),
    };
    let app = Router::new()
        .route(path, any(scripted))
        .route("/v1/listen", get(ws_echo))
        .route("/v1/hangup", get(ws_hangup))
        .with_state(script);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    ScriptedServer { addr, hits }
}

/// A health endpoint that always answers 200.
pub async fn spawn_healthy_server() -> ScriptedServer {
    spawn_scripted_server("/health", vec![200]).await
}
