//! Voxhost server binary: deploys the configured voice providers and
//! reports on them over HTTP.
//!
//! Starts an axum HTTP server with structured logging, brings up every
//! configured provider instance, and tears all of them down on
//! SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use voxhost_deploy::{DeploymentOrchestrator, DockerRuntime, EventSink};
use voxhost_server::{app, background, boot_instances, build_registry, config, AppState};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VOXHOST_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("voxhost.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let events = EventSink::new();
    tokio::spawn(background::log_events(events.subscribe()));

    let orchestrator = Arc::new(
        DeploymentOrchestrator::new(
            config.deploy.clone(),
            build_registry(&config.templates),
            Arc::new(DockerRuntime::new()),
            events,
        )
        .expect("invalid deploy configuration, check the [deploy] port range"),
    );

    let started = boot_instances(&orchestrator, &config.instances).await;
    tracing::info!(
        configured = config.instances.len(),
        started,
        "provider instances brought up"
    );

    // Build application
    let app = app(AppState {
        orchestrator: orchestrator.clone(),
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting voxhost server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    orchestrator.cleanup().await;
    tracing::info!("voxhost server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
