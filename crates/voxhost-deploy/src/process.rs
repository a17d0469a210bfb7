//! Native-process deployment.
//!
//! A [`ProcessLifecycleManager`] resolves a runtime executable, makes sure
//! the provider package is installed into it, then spawns the provider in
//! its own session so the whole process group can be signalled on stop.
//! Output is captured line by line into the log and a bounded ring buffer.

use crate::error::DeployError;
use crate::events::{EventSink, LifecycleEvent};
use crate::health::HealthPoller;
use crate::lifecycle::ProviderLifecycle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use voxhost_types::{HealthCheck, InstanceStatus};

/// Time given to a fresh process before its liveness is checked.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Lines of combined stdout/stderr retained per process.
pub const OUTPUT_BUFFER_LINES: usize = 200;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEPENDENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(1);
const PORT_PLACEHOLDER: &str = "{port}";

/// Resolved configuration for one process-mode instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    pub provider_id: String,
    /// Explicit runtime executable; skips detection when set.
    pub runtime_path: Option<String>,
    pub runtime_candidates: Vec<String>,
    pub min_version: Option<(u32, u32)>,
    pub package: Option<String>,
    pub install_command: Option<Vec<String>>,
    /// Arguments passed to the runtime; `{port}` is substituted.
    pub args: Vec<String>,
    /// Extra environment; `{port}` is substituted in values.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Host port the process is told to bind.
    pub port: u16,
    /// When set, start also waits for the HTTP health endpoint.
    pub health: Option<HealthCheck>,
    pub settle_delay: Duration,
    pub install_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ProcessConfig {
    pub fn new(provider_id: impl Into<String>, port: u16) -> Self {
        Self {
            provider_id: provider_id.into(),
            runtime_path: None,
            runtime_candidates: Vec::new(),
            min_version: None,
            package: None,
            install_command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            port,
            health: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    fn substitute(&self, value: &str) -> String {
        value.replace(PORT_PLACEHOLDER, &self.port.to_string())
    }

    fn resolved_args(&self) -> Vec<String> {
        self.args.iter().map(|arg| self.substitute(arg)).collect()
    }

    fn resolved_env(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), self.substitute(v)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    NotStarted,
    DetectingRuntime,
    CheckingDependency,
    Installing,
    Spawning,
    Running,
    Stopping,
    ForceKilling,
    Stopped,
    Error,
}

impl ProcessPhase {
    fn instance_status(self) -> InstanceStatus {
        match self {
            Self::NotStarted => InstanceStatus::NotStarted,
            Self::DetectingRuntime | Self::CheckingDependency | Self::Installing | Self::Spawning => {
                InstanceStatus::Starting
            }
            Self::Running => InstanceStatus::Ready,
            Self::Stopping | Self::ForceKilling => InstanceStatus::Stopping,
            Self::Stopped => InstanceStatus::Stopped,
            Self::Error => InstanceStatus::Error,
        }
    }
}

/// A runtime executable that passed the version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedRuntime {
    pub path: String,
    pub version: (u32, u32),
}

/// Liveness plus best-effort resource usage of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStatus {
    pub pid: u32,
    pub running: bool,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
}

#[derive(Debug)]
struct ProcessRecord {
    phase: ProcessPhase,
    pid: Option<u32>,
    runtime: Option<String>,
    /// Set once the child was reaped: its exit code, if it had one.
    exit: Option<Option<i32>>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Default for ProcessRecord {
    fn default() -> Self {
        Self {
            phase: ProcessPhase::NotStarted,
            pid: None,
            runtime: None,
            exit: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Fixed-capacity line buffer; the oldest line is dropped first.
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

#[derive(Debug)]
pub struct ProcessLifecycleManager {
    config: ProcessConfig,
    poller: HealthPoller,
    events: EventSink,
    record: Arc<Mutex<ProcessRecord>>,
    output: Arc<Mutex<OutputBuffer>>,
    transition: tokio::sync::Mutex<()>,
}

impl ProcessLifecycleManager {
    pub fn new(config: ProcessConfig, http: reqwest::Client, events: EventSink) -> Self {
        let mut poller = HealthPoller::new(http);
        if let Some(health) = &config.health {
            poller = poller
                .with_interval(Duration::from_millis(health.interval_ms))
                .with_probe_timeout(Duration::from_millis(health.timeout_ms));
        }
        Self {
            config,
            poller,
            events,
            record: Arc::new(Mutex::new(ProcessRecord::default())),
            output: Arc::new(Mutex::new(OutputBuffer::new(OUTPUT_BUFFER_LINES))),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn phase(&self) -> ProcessPhase {
        lock(&self.record).phase
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.record).pid
    }

    /// Runtime executable used by the last start.
    pub fn runtime(&self) -> Option<String> {
        lock(&self.record).runtime.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.record).started_at
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.record).last_error.clone()
    }

    /// The most recent captured output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        lock(&self.output).snapshot()
    }

    /// Tries every candidate executable in order and returns the first one
    /// whose reported version meets the minimum.
    pub async fn detect_runtime(&self) -> Result<DetectedRuntime, DeployError> {
        for candidate in &self.config.runtime_candidates {
            let Some(version) = probe_version(candidate).await else {
                tracing::debug!(candidate = %candidate, "runtime candidate unusable");
                continue;
            };
            if let Some(min) = self.config.min_version {
                if version < min {
                    tracing::debug!(
                        candidate = %candidate,
                        version = ?version,
                        min = ?min,
                        "runtime candidate too old"
                    );
                    continue;
                }
            }
            tracing::info!(runtime = %candidate, version = ?version, "runtime detected");
            return Ok(DetectedRuntime {
                path: candidate.clone(),
                version,
            });
        }
        Err(DeployError::RuntimeNotFound {
            tried: self.config.runtime_candidates.join(", "),
        })
    }

    /// Whether the provider package is present in the runtime. Providers
    /// without a package always count as installed. Never fails.
    pub async fn check_dependency_installed(&self, runtime_path: &str) -> bool {
        let Some(package) = &self.config.package else {
            return true;
        };
        let probe = Command::new(runtime_path)
            .args(["-m", "pip", "show", package.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(DEPENDENCY_PROBE_TIMEOUT, probe).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(runtime = runtime_path, error = %e, "dependency probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(runtime = runtime_path, "dependency probe timed out");
                false
            }
        }
    }

    /// Installs the provider package, or runs `custom_command` instead of
    /// the default `pip install`, within the configured timeout.
    pub async fn install_dependency(
        &self,
        runtime_path: &str,
        custom_command: Option<&[String]>,
    ) -> Result<(), DeployError> {
        let argv: Vec<String> = match (custom_command, &self.config.package) {
            (Some(custom), _) => custom.to_vec(),
            (None, Some(package)) => vec![
                runtime_path.to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                package.clone(),
            ],
            (None, None) => return Ok(()),
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(DeployError::InstallFailed("install command is empty".to_string()));
        };

        tracing::info!(provider_id = %self.config.provider_id, command = ?argv, "installing provider dependency");
        let run = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.install_timeout, run)
            .await
            .map_err(|_| {
                DeployError::InstallFailed(format!(
                    "timed out after {} ms",
                    self.config.install_timeout.as_millis()
                ))
            })?
            .map_err(|e| DeployError::InstallFailed(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::InstallFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Spawns the provider process and returns its pid once it survived the
    /// settle delay (and, if configured, answered its health endpoint).
    pub async fn start_process(&self) -> Result<u32, DeployError> {
        let _guard = self.transition.lock().await;
        if let Some(pid) = self.live_pid() {
            if self.phase() == ProcessPhase::Running {
                return Ok(pid);
            }
        }

        match self.launch().await {
            Ok(pid) => Ok(pid),
            Err(e) => {
                tracing::error!(provider_id = %self.config.provider_id, error = %e, "process start failed");
                let mut record = lock(&self.record);
                record.phase = ProcessPhase::Error;
                record.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<u32, DeployError> {
        let runtime = match &self.config.runtime_path {
            Some(path) => path.clone(),
            None => {
                self.set_phase(ProcessPhase::DetectingRuntime);
                self.detect_runtime().await?.path
            }
        };

        self.set_phase(ProcessPhase::CheckingDependency);
        if !self.check_dependency_installed(&runtime).await {
            self.set_phase(ProcessPhase::Installing);
            self.install_dependency(&runtime, self.config.install_command.as_deref())
                .await?;
        }

        self.set_phase(ProcessPhase::Spawning);
        let pid = self.spawn(&runtime)?;

        tokio::time::sleep(self.config.settle_delay).await;
        if !self.is_process_running(pid) {
            let tail = self.recent_output().into_iter().rev().take(5).collect::<Vec<_>>();
            return Err(DeployError::ProcessSpawnFailed(format!(
                "process {} exited during startup: {}",
                pid,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }

        if let Some(health) = &self.config.health {
            let endpoint = format!("http://127.0.0.1:{}{}", self.config.port, health.path);
            let waited = self
                .poller
                .wait_for_healthy(&endpoint, Duration::from_millis(health.max_wait_ms))
                .await;
            if let Err(e) = waited {
                signal_group(pid, Signal::Kill);
                return Err(e);
            }
        }

        {
            let mut record = lock(&self.record);
            record.phase = ProcessPhase::Running;
            record.started_at = Some(Utc::now());
            record.last_error = None;
        }
        tracing::info!(provider_id = %self.config.provider_id, pid, port = self.config.port, "process running");
        self.events.emit(LifecycleEvent::ProcessStarted { pid });
        Ok(pid)
    }

    fn spawn(&self, runtime: &str) -> Result<u32, DeployError> {
        let mut command = Command::new(runtime);
        command
            .args(self.config.resolved_args())
            .envs(self.config.resolved_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        // New session: no controlling terminal, and the pid doubles as the
        // process group id for signalling.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| DeployError::ProcessSpawnFailed(format!("failed to spawn {}: {}", runtime, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| DeployError::ProcessSpawnFailed("process exited before reporting a pid".to_string()))?;

        {
            let mut record = lock(&self.record);
            record.pid = Some(pid);
            record.runtime = Some(runtime.to_string());
            record.exit = None;
        }
        lock(&self.output).lines.clear();

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr, "stderr");
        }

        // Reaps the child so a dead process never lingers as a zombie.
        let record = self.record.clone();
        let events = self.events.clone();
        let provider_id = self.config.provider_id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(provider_id = %provider_id, pid, error = %e, "failed to wait on process");
                    None
                }
            };
            {
                let mut record = lock(&record);
                if record.pid == Some(pid) {
                    record.exit = Some(exit_code);
                    if record.phase == ProcessPhase::Running {
                        record.phase = ProcessPhase::Error;
                        record.last_error = Some(format!("process exited unexpectedly with {:?}", exit_code));
                    }
                }
            }
            tracing::info!(provider_id = %provider_id, pid, exit_code = ?exit_code, "process exited");
            events.emit(LifecycleEvent::ProcessExited { pid, exit_code });
        });

        Ok(pid)
    }

    fn forward_output<R>(&self, reader: R, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        let provider_id = self.config.provider_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(provider_id = %provider_id, stream, "{}", line);
                lock(&output).push(line);
            }
        });
    }

    /// Liveness of `pid`. For the managed child a recorded exit wins over
    /// the signal probe.
    pub fn is_process_running(&self, pid: u32) -> bool {
        {
            let record = lock(&self.record);
            if record.pid == Some(pid) && record.exit.is_some() {
                return false;
            }
        }
        process_alive(pid)
    }

    fn live_pid(&self) -> Option<u32> {
        self.pid().filter(|pid| self.is_process_running(*pid))
    }

    /// SIGTERM to the process group, then SIGKILL once `timeout` passes.
    ///
    /// Fails with `ProcessShutdownFailed` only if the process outlives the
    /// kill as well.
    pub async fn stop_process(&self, pid: u32, timeout: Duration) -> Result<(), DeployError> {
        self.set_phase(ProcessPhase::Stopping);
        signal_group(pid, Signal::Term);
        if self.wait_for_exit(pid, timeout).await {
            self.finish_stop(pid, false);
            return Ok(());
        }

        tracing::warn!(pid, timeout_ms = timeout.as_millis() as u64, "process ignored SIGTERM, killing");
        self.set_phase(ProcessPhase::ForceKilling);
        signal_group(pid, Signal::Kill);
        if self.wait_for_exit(pid, KILL_WAIT).await {
            self.finish_stop(pid, true);
            return Ok(());
        }

        let mut record = lock(&self.record);
        record.phase = ProcessPhase::Error;
        record.last_error = Some(format!("process {} survived SIGKILL", pid));
        Err(DeployError::ProcessShutdownFailed { pid })
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let poll = async {
            let mut ticker = tokio::time::interval(STOP_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if !self.is_process_running(pid) {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    fn finish_stop(&self, pid: u32, forced: bool) {
        {
            let mut record = lock(&self.record);
            if record.pid == Some(pid) {
                record.pid = None;
            }
            record.phase = ProcessPhase::Stopped;
        }
        tracing::info!(provider_id = %self.config.provider_id, pid, forced, "process stopped");
        self.events.emit(LifecycleEvent::ProcessStopped { pid, forced });
    }

    /// Liveness plus resource usage. Usage that cannot be read is left out.
    pub fn get_process_status(&self, pid: u32) -> ProcessStatus {
        let running = self.is_process_running(pid);
        let mut status = ProcessStatus {
            pid,
            running,
            memory_bytes: None,
            cpu_percent: None,
        };
        if running {
            let mut system = System::new();
            let sys_pid = Pid::from_u32(pid);
            if system.refresh_process(sys_pid) {
                if let Some(process) = system.process(sys_pid) {
                    status.memory_bytes = Some(process.memory());
                    status.cpu_percent = Some(process.cpu_usage());
                }
            }
        }
        status
    }

    fn set_phase(&self, phase: ProcessPhase) {
        tracing::debug!(provider_id = %self.config.provider_id, phase = ?phase, "process phase");
        lock(&self.record).phase = phase;
    }
}

#[async_trait]
impl ProviderLifecycle for ProcessLifecycleManager {
    async fn start(&self) -> Result<String, DeployError> {
        self.start_process().await.map(|pid| pid.to_string())
    }

    async fn stop(&self) {
        let _guard = self.transition.lock().await;
        match self.live_pid() {
            Some(pid) => {
                if let Err(e) = self.stop_process(pid, self.config.stop_timeout).await {
                    tracing::warn!(provider_id = %self.config.provider_id, error = %e, "process shutdown incomplete");
                }
            }
            None => {
                let mut record = lock(&self.record);
                record.pid = None;
                record.phase = ProcessPhase::Stopped;
            }
        }
    }

    async fn status(&self) -> InstanceStatus {
        let phase = self.phase();
        if phase == ProcessPhase::Running && self.live_pid().is_none() {
            return InstanceStatus::Error;
        }
        phase.instance_status()
    }

    fn endpoint(&self) -> Option<String> {
        (self.config.port != 0).then(|| format!("http://127.0.0.1:{}", self.config.port))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs `<candidate> --version` and parses the first `major.minor` pair
/// printed on stdout or stderr.
async fn probe_version(candidate: &str) -> Option<(u32, u32)> {
    let run = Command::new(candidate)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(VERSION_PROBE_TIMEOUT, run).await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    parse_version(&String::from_utf8_lossy(&output.stdout))
        .or_else(|| parse_version(&String::from_utf8_lossy(&output.stderr)))
}

/// Finds the first `X.Y` version number in free-form text.
pub fn parse_version(text: &str) -> Option<(u32, u32)> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .find_map(|token| {
            let mut parts = token.split('.');
            let major = parts.next()?.parse().ok()?;
            let minor = parts.next()?.parse().ok()?;
            Some((major, minor))
        })
}

/// Non-destructive liveness probe for any pid.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        if unsafe { libc::kill(raw, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signals the process group led by `pid`, falling back to the pid alone
/// when it does not lead a group.
fn signal_group(pid: u32, signal: Signal) {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if raw <= 0 {
            return;
        }
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            if libc::kill(-raw, sig) != 0 {
                libc::kill(raw, sig);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        if system.refresh_process(sys_pid) {
            if let Some(process) = system.process(sys_pid) {
                let _ = signal;
                process.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions_from_runtime_banners() {
        assert_eq!(parse_version("Python 3.11.4"), Some((3, 11)));
        assert_eq!(parse_version("node v20.5.1\n"), Some((20, 5)));
        assert_eq!(parse_version("piper 1.2"), Some((1, 2)));
        assert_eq!(parse_version("no digits here"), None);
        assert_eq!(parse_version("build 42"), None);
    }

    #[test]
    fn port_placeholder_is_substituted_in_args_and_env() {
        let mut config = ProcessConfig::new("piper-1", 5123);
        config.args = vec!["--port".to_string(), "{port}".to_string()];
        config
            .env
            .insert("BIND".to_string(), "127.0.0.1:{port}".to_string());
        assert_eq!(config.resolved_args(), vec!["--port", "5123"]);
        assert_eq!(config.resolved_env().get("BIND").unwrap(), "127.0.0.1:5123");
    }

    #[test]
    fn output_buffer_keeps_the_newest_lines() {
        let mut buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn current_process_is_alive_and_pid_zero_is_not() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
