//! Eviction worker pool.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use pod_refresh_workqueue::WorkQueue;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::informer::PodLister;
use crate::task::PodKey;

/// Errors from an eviction request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvictionError {
    /// The pod no longer exists.
    #[error("pod not found")]
    NotFound,

    /// The eviction would violate a disruption budget.
    #[error("eviction refused: {0}")]
    TooManyRequests(String),

    #[error("eviction request failed: {0}")]
    Api(String),
}

/// Issues eviction requests for single pods.
#[async_trait]
pub trait Evictor: Send + Sync {
    async fn evict(&self, key: &PodKey) -> Result<(), EvictionError>;
}

/// One worker per available CPU.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Drains the eviction queue.
pub struct WorkerPool {
    queue: WorkQueue<PodKey>,
    evictor: Arc<dyn Evictor>,
    pods: Arc<dyn PodLister>,
}

impl WorkerPool {
    pub fn new(queue: WorkQueue<PodKey>, evictor: Arc<dyn Evictor>, pods: Arc<dyn PodLister>) -> Self {
        Self {
            queue,
            evictor,
            pods,
        }
    }

    /// Spawn `count` worker loops.
    pub fn start(self: Arc<Self>, count: usize) -> RunningWorkers {
        let count = count.max(1);
        info!(workers = count, "Starting eviction workers");

        let handles = (0..count)
            .map(|id| {
                let pool = Arc::clone(&self);
                tokio::spawn(async move {
                    while pool.process_next().await {}
                    debug!(worker = id, "Eviction worker stopped");
                })
            })
            .collect();

        RunningWorkers {
            queue: self.queue.clone(),
            handles,
        }
    }

    /// Process one key. Returns `false` once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.evict(&key).await {
            Ok(()) => {
                self.queue.forget(&key);
            }
            Err(e) => {
                let retries = self.queue.num_requeues(&key);
                match &e {
                    EvictionError::TooManyRequests(_) => {
                        info!(pod = %key, retries, error = %e, "Eviction blocked, will retry");
                    }
                    _ => warn!(pod = %key, retries, error = %e, "Eviction failed, will retry"),
                }
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }

    async fn evict(&self, key: &PodKey) -> Result<(), EvictionError> {
        if self.pods.get(&key.namespace, &key.name).is_none() {
            debug!(pod = %key, "Pod already gone");
            return Ok(());
        }

        match self.evictor.evict(key).await {
            Ok(()) => {
                info!(pod = %key, "Pod evicted");
                Ok(())
            }
            Err(EvictionError::NotFound) => {
                debug!(pod = %key, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Handle to spawned worker loops.
pub struct RunningWorkers {
    queue: WorkQueue<PodKey>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningWorkers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Shut the queue down and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.queue.shut_down();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Eviction worker panicked");
            }
        }
        info!("Eviction workers stopped");
    }
}
