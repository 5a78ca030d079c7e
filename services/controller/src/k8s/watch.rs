//! Feeds an [`Informer`] from a `kube` watch stream.

use std::fmt::Debug;
use std::sync::Arc;

use futures_util::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::informer::Informer;

/// Spawn a task mirroring `api` into `informer` until `shutdown` flips.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub fn spawn_informer<K>(
    api: Api<K>,
    config: watcher::Config,
    informer: Arc<Informer<K>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let kind = informer.kind().to_string();
        let mut stream = watcher(api, config).default_backoff().boxed();

        info!(kind = %kind, "Starting watch");
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            match event {
                Some(Ok(event)) => informer.handle_event(event),
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch failed, retrying"),
                None => {
                    warn!(kind = %kind, "Watch stream ended");
                    break;
                }
            }
        }
        debug!(kind = %kind, "Watch stopped");
    })
}
