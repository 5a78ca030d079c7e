//! Wires the caches, policy, filter and workers into one leader-scoped run.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use pod_refresh_workqueue::WorkQueue;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::filter::DeploymentFilter;
use crate::informer::{CacheError, Informer};
use crate::policy::PolicyStore;
use crate::task::PodKey;
use crate::worker::{Evictor, WorkerPool};

/// Name of the eviction queue, used in logs.
pub const QUEUE_NAME: &str = "pod-refresh";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to sync caches: {0}")]
    CacheSync(#[from] CacheError),
}

/// Runtime settings for one controller run.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name of the pod running this controller.
    pub own_pod_name: String,
    pub resync_period: Duration,
    pub workers: usize,
    pub cache_sync_timeout: Duration,
}

/// The three caches the controller reads.
#[derive(Clone, Default)]
pub struct Informers {
    pub deployments: Arc<Informer<Deployment>>,
    pub pods: Arc<Informer<Pod>>,
    pub config_maps: Arc<Informer<ConfigMap>>,
}

impl Informers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every cache has completed its first listing.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), CacheError> {
        tokio::try_join!(
            self.deployments.wait_synced(timeout),
            self.pods.wait_synced(timeout),
            self.config_maps.wait_synced(timeout),
        )?;
        Ok(())
    }

    fn resync(&self) {
        self.deployments.resync();
        self.config_maps.resync();
    }
}

pub struct Controller {
    config: ControllerConfig,
    informers: Informers,
    queue: WorkQueue<PodKey>,
    pool: Arc<WorkerPool>,
}

impl Controller {
    /// Build the controller and register its handlers on `informers`.
    ///
    /// Call this before the caches start receiving events so the initial
    /// listing reaches the policy store.
    pub fn new(
        config: ControllerConfig,
        informers: Informers,
        policy: Arc<PolicyStore>,
        evictor: Arc<dyn Evictor>,
    ) -> Self {
        let queue = WorkQueue::with_default_rate_limiter(QUEUE_NAME);

        informers.config_maps.add_handler(policy.clone());
        informers.deployments.add_handler(Arc::new(DeploymentFilter::new(
            config.own_pod_name.clone(),
            policy,
            informers.pods.clone(),
            queue.clone(),
        )));

        let pool = Arc::new(WorkerPool::new(queue.clone(), evictor, informers.pods.clone()));

        Self {
            config,
            informers,
            queue,
            pool,
        }
    }

    /// Run until `scope` flips to `true`.
    ///
    /// Fails only if the caches do not sync within the configured window.
    pub async fn run(self, mut scope: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!(
            workers = self.config.workers,
            resync_period = ?self.config.resync_period,
            "Starting pod refresh controller"
        );

        tokio::select! {
            synced = self.informers.wait_synced(self.config.cache_sync_timeout) => synced?,
            _ = scope.wait_for(|stop| *stop) => {
                info!("Stopped before caches synced");
                self.queue.shut_down();
                return Ok(());
            }
        }
        info!(
            deployments = self.informers.deployments.len(),
            pods = self.informers.pods.len(),
            "Caches synced"
        );

        let workers = Arc::clone(&self.pool).start(self.config.workers);

        let mut resync = tokio::time::interval(self.config.resync_period);
        // First tick fires immediately; the initial listing already dispatched.
        resync.tick().await;

        loop {
            tokio::select! {
                _ = resync.tick() => {
                    debug!("Resyncing caches");
                    self.informers.resync();
                }
                changed = scope.changed() => {
                    if changed.is_err() || *scope.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Pod refresh controller shutting down");
        workers.shutdown().await;
        Ok(())
    }
}
