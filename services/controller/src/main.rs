//! Pod refresh controller binary.
//!
//! Campaigns for the controller lease and, while leading, watches
//! deployments, pods and the policy config object in its own namespace.
//! Losing the lease terminates the process so it restarts as a candidate.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pod_refresh_controller::k8s::{self, KubeEvictor, KubeLeaseLock};
use pod_refresh_controller::{
    Config, Controller, ElectionState, Informers, LeaderElector, PolicyStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    if run().await? == ElectionState::LostLease {
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<ElectionState> {
    let config = Config::from_env().context("invalid configuration")?;

    // Prefer RUST_LOG, fall back to LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        pod = %config.pod_name,
        namespace = %config.namespace,
        config_map = %config.config_map_name,
        workers = config.workers,
        local = config.local,
        "Starting pod refresh controller"
    );

    let client = k8s::connect(config.local).await?;

    let lock = Arc::new(KubeLeaseLock::new(
        client.clone(),
        &config.namespace,
        config.lease_name.clone(),
    ));
    let elector = LeaderElector::new(config.election.clone(), lock)
        .context("failed to set up leader election")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let state = elector
        .run(shutdown_rx, move |scope| async move {
            let informers = Informers::new();
            let policy = Arc::new(PolicyStore::new(config.config_map_name.clone()));
            let evictor = Arc::new(KubeEvictor::new(client.clone()));
            let controller = Controller::new(
                config.controller_config(),
                informers.clone(),
                policy,
                evictor,
            );

            let watches = k8s::spawn_informers(
                &client,
                &config.namespace,
                &config.config_map_name,
                &informers,
                scope.clone(),
            );

            let result = controller.run(scope).await;
            for watch in watches {
                watch.abort();
            }
            result.context("controller failed")
        })
        .await?;

    match state {
        ElectionState::LostLease => error!("Leadership lost, exiting"),
        _ => info!("Pod refresh controller stopped"),
    }
    Ok(state)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
