//! Kubernetes API adapters: client construction, watches, eviction and the
//! lease lock.

mod evictor;
mod lease;
mod watch;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::config::KubeConfigOptions;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::info;

pub use evictor::KubeEvictor;
pub use lease::KubeLeaseLock;
pub use watch::spawn_informer;

use crate::controller::Informers;

/// Build a client from the service account, or from the local kubeconfig
/// when `local` is set.
pub async fn connect(local: bool) -> Result<Client> {
    let config = if local {
        info!("Using local kubeconfig");
        kube::Config::from_kubeconfig(&KubeConfigOptions::default())
            .await
            .context("failed to load kubeconfig")?
    } else {
        kube::Config::incluster().context("failed to load in-cluster config")?
    };

    Client::try_from(config).context("failed to build Kubernetes client")
}

/// Start watches for every cache in `informers`, scoped to `namespace`.
///
/// The config cache only watches the object named `config_map_name`.
pub fn spawn_informers(
    client: &Client,
    namespace: &str,
    config_map_name: &str,
    informers: &Informers,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_informer(
            Api::<Deployment>::namespaced(client.clone(), namespace),
            watcher::Config::default(),
            informers.deployments.clone(),
            shutdown.clone(),
        ),
        spawn_informer(
            Api::<Pod>::namespaced(client.clone(), namespace),
            watcher::Config::default(),
            informers.pods.clone(),
            shutdown.clone(),
        ),
        spawn_informer(
            Api::<ConfigMap>::namespaced(client.clone(), namespace),
            watcher::Config::default().fields(&format!("metadata.name={config_map_name}")),
            informers.config_maps.clone(),
            shutdown,
        ),
    ]
}
