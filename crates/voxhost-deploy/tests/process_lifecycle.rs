#![cfg(unix)]

mod common;

use common::spawn_scripted_server;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use voxhost_deploy::{
    DeployError, EventSink, LifecycleEvent, ProcessConfig, ProcessLifecycleManager, ProcessPhase,
    ProviderLifecycle,
};
use voxhost_types::{HealthCheck, InstanceStatus};

fn shell(id: &str, script: &str) -> ProcessConfig {
    let mut config = ProcessConfig::new(id, 0);
    config.runtime_path = Some("/bin/sh".to_string());
    config.args = vec!["-c".to_string(), script.to_string()];
    config.settle_delay = Duration::from_millis(150);
    config
}

fn manager(config: ProcessConfig, events: EventSink) -> ProcessLifecycleManager {
    ProcessLifecycleManager::new(config, reqwest::Client::new(), events)
}

fn write_executable(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

async fn wait_for_output(manager: &ProcessLifecycleManager, needle: &str) {
    for _ in 0..50 {
        if manager.recent_output().iter().any(|line| line.contains(needle)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("output never contained {:?}: {:?}", needle, manager.recent_output());
}

#[tokio::test]
async fn detects_first_runtime_meeting_minimum_version() {
    let dir = tempfile::tempdir().unwrap();
    let old = write_executable(dir.path(), "python-old", "echo 'Python 3.7.9'");
    // Some interpreters print their version on stderr.
    let new = write_executable(dir.path(), "python-new", "echo 'Python 3.11.4' >&2");

    let mut config = ProcessConfig::new("tts-local", 5000);
    config.runtime_candidates = vec![
        dir.path().join("missing").to_string_lossy().into_owned(),
        old,
        new.clone(),
    ];
    config.min_version = Some((3, 9));
    let manager = manager(config, EventSink::new());

    let detected = manager.detect_runtime().await.unwrap();
    assert_eq!(detected.path, new);
    assert_eq!(detected.version, (3, 11));
}

#[tokio::test]
async fn no_usable_runtime_lists_what_was_tried() {
    let mut config = ProcessConfig::new("tts-local", 5000);
    config.runtime_candidates = vec![
        "/nonexistent/python3".to_string(),
        "/nonexistent/python".to_string(),
    ];
    let manager = manager(config, EventSink::new());

    match manager.detect_runtime().await.unwrap_err() {
        DeployError::RuntimeNotFound { tried } => {
            assert!(tried.contains("/nonexistent/python3"));
            assert!(tried.contains("/nonexistent/python"));
        }
        other => panic!("expected RuntimeNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn dependency_probe_never_fails() {
    let mut config = ProcessConfig::new("tts-local", 5000);
    config.package = Some("piper-tts".to_string());
    let manager = manager(config, EventSink::new());

    assert!(!manager.check_dependency_installed("/bin/false").await);
    assert!(!manager.check_dependency_installed("/nonexistent/python").await);

    let no_package = ProcessLifecycleManager::new(
        ProcessConfig::new("tts-local", 5000),
        reqwest::Client::new(),
        EventSink::new(),
    );
    assert!(no_package.check_dependency_installed("/bin/false").await);
}

#[tokio::test]
async fn failing_install_reports_its_stderr() {
    let manager = manager(ProcessConfig::new("tts-local", 5000), EventSink::new());
    let command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "echo 'no matching distribution' >&2; exit 3".to_string(),
    ];

    match manager.install_dependency("/bin/sh", Some(&command)).await.unwrap_err() {
        DeployError::InstallFailed(message) => assert!(message.contains("no matching distribution")),
        other => panic!("expected InstallFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn slow_install_times_out() {
    let mut config = ProcessConfig::new("tts-local", 5000);
    config.install_timeout = Duration::from_millis(200);
    let manager = manager(config, EventSink::new());
    let command = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()];

    let err = manager
        .install_dependency("/bin/sh", Some(&command))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::InstallFailed(ref m) if m.contains("timed out")), "got {:?}", err);
}

#[tokio::test]
async fn start_status_and_graceful_stop() {
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let manager = manager(shell("tts-local", "echo ready; exec sleep 30"), events);

    let pid = manager.start_process().await.unwrap();

    assert_eq!(manager.phase(), ProcessPhase::Running);
    assert_eq!(manager.pid(), Some(pid));
    assert_eq!(manager.runtime().as_deref(), Some("/bin/sh"));
    assert!(manager.started_at().is_some());
    assert!(manager.is_process_running(pid));
    assert_eq!(manager.status().await, InstanceStatus::Ready);
    wait_for_output(&manager, "ready").await;

    let status = manager.get_process_status(pid);
    assert_eq!(status.pid, pid);
    assert!(status.running);

    // A second start reuses the live process.
    assert_eq!(manager.start_process().await.unwrap(), pid);

    manager.stop_process(pid, Duration::from_secs(2)).await.unwrap();

    assert!(!manager.is_process_running(pid));
    assert!(!manager.get_process_status(pid).running);
    assert_eq!(manager.phase(), ProcessPhase::Stopped);

    let mut stopped = None;
    while let Ok(event) = rx.try_recv() {
        if let LifecycleEvent::ProcessStopped { pid: p, forced } = event {
            stopped = Some((p, forced));
        }
    }
    assert_eq!(stopped, Some((pid, false)));
}

#[tokio::test]
async fn process_ignoring_sigterm_is_killed() {
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let manager = manager(
        shell("stubborn", "trap '' TERM; echo armed; while true; do sleep 0.1; done"),
        events,
    );
    let pid = manager.start_process().await.unwrap();
    wait_for_output(&manager, "armed").await;

    manager
        .stop_process(pid, Duration::from_millis(300))
        .await
        .unwrap();

    assert!(!manager.is_process_running(pid));
    let mut forced = None;
    while let Ok(event) = rx.try_recv() {
        if let LifecycleEvent::ProcessStopped { forced: f, .. } = event {
            forced = Some(f);
        }
    }
    assert_eq!(forced, Some(true));
}

#[tokio::test]
async fn early_exit_is_a_spawn_failure_with_output_tail() {
    let manager = manager(
        shell("crashy", "echo 'model file missing'; exit 2"),
        EventSink::new(),
    );

    match manager.start_process().await.unwrap_err() {
        DeployError::ProcessSpawnFailed(message) => {
            assert!(message.contains("model file missing"), "message was {}", message)
        }
        other => panic!("expected ProcessSpawnFailed, got {:?}", other),
    }
    assert_eq!(manager.phase(), ProcessPhase::Error);
    assert!(manager.last_error().is_some());
    assert_eq!(manager.status().await, InstanceStatus::Error);
}

#[tokio::test]
async fn missing_runtime_is_a_spawn_failure() {
    let mut config = shell("tts-local", "true");
    config.runtime_path = Some("/nonexistent/python3".to_string());
    let manager = manager(config, EventSink::new());

    let err = manager.start_process().await.unwrap_err();
    assert!(matches!(err, DeployError::ProcessSpawnFailed(_)), "got {:?}", err);
}

#[tokio::test]
async fn port_placeholder_reaches_the_process() {
    let mut config = shell("tts-local", "echo \"listening on $1 and $VOX_PORT\"; exec sleep 30");
    config.port = 5123;
    config.args.push("worker".to_string());
    config.args.push("{port}".to_string());
    config.env.insert("VOX_PORT".to_string(), "{port}".to_string());
    let manager = manager(config, EventSink::new());

    manager.start().await.unwrap();
    wait_for_output(&manager, "listening on 5123 and 5123").await;
    assert_eq!(manager.endpoint().as_deref(), Some("http://127.0.0.1:5123"));

    manager.stop().await;
    assert_eq!(manager.status().await, InstanceStatus::Stopped);
}

#[tokio::test]
async fn health_gate_passes_against_a_live_endpoint() {
    let server = spawn_scripted_server("/health", vec![503, 200]).await;
    let mut config = shell("tts-local", "exec sleep 30");
    config.port = server.addr.port();
    config.health = Some(HealthCheck {
        path: "/health".to_string(),
        interval_ms: 20,
        timeout_ms: 500,
        max_wait_ms: 2_000,
    });
    let manager = manager(config, EventSink::new());

    manager.start_process().await.unwrap();
    assert_eq!(server.hits(), 2);

    manager.stop().await;
}

#[tokio::test]
async fn failed_health_gate_kills_the_process() {
    let server = spawn_scripted_server("/health", vec![503]).await;
    let mut config = shell("tts-local", "exec sleep 30");
    config.port = server.addr.port();
    config.health = Some(HealthCheck {
        path: "/health".to_string(),
        interval_ms: 20,
        timeout_ms: 500,
        max_wait_ms: 200,
    });
    let manager = manager(config, EventSink::new());

    let err = manager.start_process().await.unwrap_err();
    assert!(matches!(err, DeployError::HealthCheckTimeout { .. }), "got {:?}", err);

    let pid = manager.pid().unwrap();
    for _ in 0..50 {
        if !manager.is_process_running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("process {} survived a failed health gate", pid);
}
