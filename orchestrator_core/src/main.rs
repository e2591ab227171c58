use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubeadm_provisioner::KubeadmProvisioner;
use observability::{init_tracing, EventHub, TracingConfig};
use orchestrator_core::config::{Config, DbDriver};
use orchestrator_core::{build_router, ApiState, Orchestrator};
use provisioner_interface::ProvisionerRegistry;
use remote_shell_interface::SshConnector;
use repository_interface::{create_repository, RepositoryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    init_tracing(TracingConfig::new(&config.logger.level, &config.logger.format));

    info!("Starting kubesmith server...");

    let repository = match config.database.driver {
        DbDriver::Sqlite => create_repository(RepositoryConfig::Sqlite {
            dsn: config.database.dsn.clone(),
        })
        .await
        .context("failed to initialize database")?,
        other => anyhow::bail!("database driver {other} is not compiled into this build"),
    };

    let (hub, hub_loop) = EventHub::new();
    tokio::spawn(hub_loop.run());

    let mut registry = ProvisionerRegistry::new();
    KubeadmProvisioner::register(&mut registry);

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        repository.clone(),
        hub.clone(),
        Arc::new(registry),
        Arc::new(SshConnector::new()),
        shutdown.clone(),
    );

    let state = ApiState::new(repository, orchestrator, hub);
    let router = build_router(state)
        .layer(tower_http::timeout::TimeoutLayer::new(config.server.write_timeout));

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    if shutdown.is_cancelled() {
        // In-flight provisioning tasks observe the cancelled token and
        // get a bounded window to record their final events.
        let grace = config.server.shutdown_timeout;
        info!(grace_secs = grace.as_secs(), "Waiting for in-flight work");
        tokio::time::sleep(grace.min(Duration::from_secs(30))).await;
    }

    info!("Server exited");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down server...");
    shutdown.cancel();
}
