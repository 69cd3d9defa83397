//! Fleet agent
//!
//! Manages one worker service per tenant on the local Docker Swarm.
//!
//! ## Startup
//!
//! 1. Load configuration from `FLEET_*` environment variables
//! 2. Wait for the Docker daemon to answer (with backoff)
//! 3. Reconcile the tenant registry against running services
//! 4. Watch the worker image and roll out new releases until shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_agent::backoff::{retry_until, BackoffPolicy};
use fleet_agent::config::Config;
use fleet_agent::platform::{DockerConfig, DockerPlatform, Platform};
use fleet_agent::registry::{SqliteRegistry, TenantRegistry};
use fleet_agent::{
    DigestState, HealthMonitor, ImageUpdateWatcher, PortAllocator, ReconciliationLoop,
    ResourceNames, ServiceLifecycleManager,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        image = %config.worker_image,
        network = %config.shared_network,
        docker_socket = %config.docker_socket,
        registry = %config.registry_path.display(),
        "Starting fleet agent"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let platform: Arc<dyn Platform> = Arc::new(DockerPlatform::new(DockerConfig {
        socket_path: config.docker_socket.clone(),
        ..DockerConfig::default()
    }));

    let reachable = retry_until(&BackoffPolicy::default(), &shutdown, "docker ping", || {
        let platform = Arc::clone(&platform);
        async move { platform.ping().await }
    })
    .await;
    if reachable.is_none() {
        info!("Shutdown requested before the platform became reachable");
        return Ok(());
    }
    info!("Platform reachable");

    if let Some(parent) = config.registry_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let registry: Arc<dyn TenantRegistry> = Arc::new(
        SqliteRegistry::open(&config.registry_path).context("failed to open tenant registry")?,
    );

    let worker_env = config.load_worker_env()?;
    info!(entries = worker_env.len(), "Worker environment loaded");

    let names = ResourceNames::try_new(config.service_prefix.clone())?;
    let lifecycle = Arc::new(ServiceLifecycleManager::new(
        Arc::clone(&platform),
        PortAllocator::new(Arc::clone(&registry), config.port_range),
        HealthMonitor::new(Arc::clone(&platform), names.clone(), shutdown.child_token()),
        names,
        config.lifecycle_config(worker_env),
    ));

    // Health waits observe the shutdown token, so this returns promptly on a signal.
    let reconciler = ReconciliationLoop::new(
        registry,
        Arc::clone(&lifecycle),
        config.rollout_concurrency,
    );
    if let Err(e) = reconciler.run_once().await {
        error!(error = %e, "Startup reconciliation failed");
    }

    let watcher = ImageUpdateWatcher::new(
        platform,
        lifecycle,
        config.watcher_config(),
        DigestState::new(),
    );
    let watcher_handle = tokio::spawn(watcher.run(shutdown.clone()));

    shutdown.cancelled().await;

    if let Err(e) = watcher_handle.await {
        error!(error = %e, "Image watcher task panicked");
    }

    info!("Fleet agent shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
