mod common;

use common::{spawn_healthy_server, MockRuntime};
use std::collections::HashSet;
use std::sync::Arc;
use voxhost_deploy::{
    DeployConfig, DeployError, DeploymentOrchestrator, EventSink, LifecycleEvent, TemplateRegistry,
};
use voxhost_types::{
    DeploymentMode, HealthCheck, InstanceOverrides, InstanceStatus, ProviderTemplate,
};

fn stt_template() -> ProviderTemplate {
    let mut template = ProviderTemplate::new("stt", DeploymentMode::Container);
    template.image = Some("ghcr.io/example/stt:latest".to_string());
    template.default_port = 8500;
    template.internal_port = 9000;
    template.health = HealthCheck {
        path: "/health".to_string(),
        interval_ms: 20,
        timeout_ms: 500,
        max_wait_ms: 2_000,
    };
    template
        .volumes
        .insert("models".to_string(), "/root/.cache".to_string());
    template
}

fn registry() -> TemplateRegistry {
    let mut registry = TemplateRegistry::builtin();
    registry.register(stt_template());
    registry
}

fn config() -> DeployConfig {
    DeployConfig {
        port_min: 8500,
        port_max: 8599,
        ..DeployConfig::default()
    }
}

fn orchestrator(runtime: Arc<MockRuntime>, config: DeployConfig) -> DeploymentOrchestrator {
    DeploymentOrchestrator::new(config, registry(), runtime, EventSink::new()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_get_distinct_ports() {
    let orchestrator = Arc::new(orchestrator(MockRuntime::new(), config()));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let orchestrator = orchestrator.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            orchestrator
                .create_provider_instance(&format!("stt-{}", i), "stt", InstanceOverrides::default())
                .map(|handle| handle.ports().to_vec())
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        let ports = task.await.unwrap().unwrap();
        assert_eq!(ports.len(), 1);
        assert!(seen.insert(ports[0]), "port {} handed out twice", ports[0]);
    }
    assert_eq!(seen.len(), 20);
    assert_eq!(orchestrator.allocated_port_count(), 20);
    assert_eq!(orchestrator.instance_ids().len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creates_with_one_id_keep_the_winners_volumes() {
    let orchestrator = Arc::new(orchestrator(MockRuntime::new(), config()));

    for _ in 0..200 {
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let barrier = barrier.clone();
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    orchestrator.create_provider_instance("dup", "stt", InstanceOverrides::default())
                })
            })
            .collect();

        let mut created = 0;
        for racer in racers {
            match racer.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(matches!(e, DeployError::InstanceAlreadyExists(_)), "got {:?}", e),
            }
        }
        assert_eq!(created, 1);

        let handle = orchestrator.get_instance("dup").unwrap();
        assert_eq!(orchestrator.tracked_volumes("dup"), handle.volumes().to_vec());
        assert_eq!(orchestrator.allocated_port_count(), 1);

        orchestrator.remove_provider_instance("dup").await.unwrap();
        assert!(orchestrator.tracked_volumes("dup").is_empty());
        assert_eq!(orchestrator.allocated_port_count(), 0);
    }
}

#[tokio::test]
async fn preferred_ports_fall_through_to_the_next_free_one() {
    let orchestrator = orchestrator(MockRuntime::new(), config());

    let first = orchestrator
        .create_provider_instance("a", "stt", InstanceOverrides::default())
        .unwrap();
    let second = orchestrator
        .create_provider_instance("b", "stt", InstanceOverrides::default())
        .unwrap();
    let pinned = orchestrator
        .create_provider_instance(
            "c",
            "stt",
            InstanceOverrides {
                port: Some(8550),
                ..InstanceOverrides::default()
            },
        )
        .unwrap();

    assert_eq!(first.ports(), &[8500]);
    assert_eq!(second.ports(), &[8501]);
    assert_eq!(pinned.ports(), &[8550]);
}

#[tokio::test]
async fn unknown_type_and_duplicate_id_are_rejected() {
    let orchestrator = orchestrator(MockRuntime::new(), config());

    let err = orchestrator
        .create_provider_instance("x", "no-such-engine", InstanceOverrides::default())
        .unwrap_err();
    assert!(matches!(err, DeployError::UnknownProviderType(_)));

    orchestrator
        .create_provider_instance("stt-1", "stt", InstanceOverrides::default())
        .unwrap();
    let err = orchestrator
        .create_provider_instance("stt-1", "stt", InstanceOverrides::default())
        .unwrap_err();
    assert!(matches!(err, DeployError::InstanceAlreadyExists(ref id) if id == "stt-1"));

    // The failed attempts leave nothing reserved.
    assert_eq!(orchestrator.allocated_port_count(), 1);
}

#[tokio::test]
async fn port_count_depends_on_mode() {
    let orchestrator = orchestrator(MockRuntime::new(), config());

    let streaming = orchestrator
        .create_provider_instance("live", "whisper-live", InstanceOverrides::default())
        .unwrap();
    let remote = orchestrator
        .create_provider_instance(
            "cloud",
            "elevenlabs",
            InstanceOverrides {
                api_key: Some("secret".to_string()),
                ..InstanceOverrides::default()
            },
        )
        .unwrap();

    assert_eq!(streaming.mode(), DeploymentMode::StreamingContainer);
    assert_eq!(streaming.ports().len(), 2);
    assert_ne!(streaming.ports()[0], streaming.ports()[1]);
    assert!(streaming.manager().as_streaming().is_some());

    assert_eq!(remote.mode(), DeploymentMode::Remote);
    assert!(remote.ports().is_empty());
    assert!(remote.volumes().is_empty());
    assert!(remote.manager().as_remote().is_some());

    assert_eq!(orchestrator.allocated_port_count(), 2);
}

#[tokio::test]
async fn removal_frees_ports_and_volume_names() {
    let runtime = MockRuntime::new();
    let events = EventSink::new();
    let mut rx = events.subscribe();
    let orchestrator =
        DeploymentOrchestrator::new(config(), registry(), runtime.clone(), events).unwrap();

    let handle = orchestrator
        .create_provider_instance("stt-1", "stt", InstanceOverrides::default())
        .unwrap();
    assert_eq!(handle.volumes(), &["voxhost_stt-1_models".to_string()]);
    assert_eq!(
        orchestrator.tracked_volumes("stt-1"),
        vec!["voxhost_stt-1_models".to_string()]
    );

    orchestrator.remove_provider_instance("stt-1").await.unwrap();

    assert_eq!(orchestrator.allocated_port_count(), 0);
    assert!(orchestrator.tracked_volumes("stt-1").is_empty());
    assert!(orchestrator.get_instance("stt-1").is_none());
    // Volumes are kept on disk unless purging is configured.
    assert_eq!(runtime.calls_named("remove_volume"), 0);

    // The freed port is handed out again.
    let again = orchestrator
        .create_provider_instance("stt-2", "stt", InstanceOverrides::default())
        .unwrap();
    assert_eq!(again.ports(), &[8500]);

    let mut removed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let LifecycleEvent::InstanceRemoved { provider_id } = event {
            removed.push(provider_id);
        }
    }
    assert_eq!(removed, vec!["stt-1".to_string()]);
}

#[tokio::test]
async fn purge_deletes_volumes_from_the_runtime() {
    let runtime = MockRuntime::new();
    let orchestrator = orchestrator(
        runtime.clone(),
        DeployConfig {
            purge_volumes_on_remove: true,
            ..config()
        },
    );

    orchestrator
        .create_provider_instance("stt-1", "stt", InstanceOverrides::default())
        .unwrap();
    orchestrator.remove_provider_instance("stt-1").await.unwrap();

    assert!(runtime
        .calls()
        .contains(&"remove_volume voxhost_stt-1_models".to_string()));
}

#[tokio::test]
async fn unknown_instances_are_not_found() {
    let orchestrator = orchestrator(MockRuntime::new(), config());

    assert!(matches!(
        orchestrator.remove_provider_instance("ghost").await,
        Err(DeployError::InstanceNotFound(_))
    ));
    assert!(matches!(
        orchestrator.start_instance("ghost").await,
        Err(DeployError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn started_instance_is_listed_as_ready() {
    let server = spawn_healthy_server().await;
    let runtime = MockRuntime::with_host_port(&[9000], server.addr.port());
    let orchestrator = orchestrator(runtime.clone(), config());

    orchestrator
        .create_provider_instance(
            "stt-1",
            "stt",
            InstanceOverrides {
                env: [("ASR_MODEL".to_string(), "base".to_string())].into(),
                ..InstanceOverrides::default()
            },
        )
        .unwrap();
    let container_id = orchestrator.start_instance("stt-1").await.unwrap();
    assert!(runtime.calls().contains(&format!("inspect {}", container_id)));
    let endpoint = format!("http://127.0.0.1:{}", server.addr.port());

    let spec = runtime.last_spec().unwrap();
    assert_eq!(spec.env.get("VOXHOST_RESERVED_PORT").map(String::as_str), Some("8500"));
    assert_eq!(spec.env.get("ASR_MODEL").map(String::as_str), Some("base"));
    assert_eq!(
        spec.binds.get("voxhost_stt-1_models").map(String::as_str),
        Some("/root/.cache")
    );

    let listed = orchestrator.list_instances().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].provider_id, "stt-1");
    assert_eq!(listed[0].status, InstanceStatus::Ready);
    assert_eq!(listed[0].endpoint.as_deref(), Some(endpoint.as_str()));
}

#[tokio::test]
async fn cleanup_stops_and_forgets_everything() {
    let server = spawn_healthy_server().await;
    let runtime = MockRuntime::with_host_port(&[9000], server.addr.port());
    let orchestrator = orchestrator(runtime.clone(), config());

    for id in ["stt-1", "stt-2"] {
        orchestrator
            .create_provider_instance(id, "stt", InstanceOverrides::default())
            .unwrap();
        orchestrator.start_instance(id).await.unwrap();
    }
    assert_eq!(runtime.running_containers(), 2);

    orchestrator.cleanup().await;

    assert_eq!(runtime.running_containers(), 0);
    assert!(orchestrator.instance_ids().is_empty());
    assert_eq!(orchestrator.allocated_port_count(), 0);
    assert!(orchestrator.list_instances().await.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn process_instance_runs_on_its_allocated_port() {
    let mut template = ProviderTemplate::new("sleeper", DeploymentMode::Process);
    template.default_port = 8520;
    template.process = Some(voxhost_types::ProcessSpec {
        args: vec!["-c".to_string(), "echo port {port}; exec sleep 30".to_string()],
        ..Default::default()
    });
    let mut registry = registry();
    registry.register(template);
    let orchestrator =
        DeploymentOrchestrator::new(config(), registry, MockRuntime::new(), EventSink::new()).unwrap();

    let handle = orchestrator
        .create_provider_instance(
            "tts-1",
            "sleeper",
            InstanceOverrides {
                runtime_path: Some("/bin/sh".to_string()),
                ..InstanceOverrides::default()
            },
        )
        .unwrap();
    assert_eq!(handle.ports(), &[8520]);

    orchestrator.start_instance("tts-1").await.unwrap();
    let process = handle.manager().as_process().unwrap();
    assert!(process
        .recent_output()
        .iter()
        .any(|line| line == "port 8520"));
    assert_eq!(handle.lifecycle().status().await, InstanceStatus::Ready);

    orchestrator.cleanup().await;
    assert_eq!(handle.lifecycle().status().await, InstanceStatus::Stopped);
}
