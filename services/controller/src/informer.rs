//! Local watch cache with typed change handlers.
//!
//! An [`Informer`] mirrors one kind of object in one namespace on top of a
//! `kube` reflector [`Store`]. Whatever feeds it (a `kube` watcher in
//! production, the test itself in tests) calls [`Informer::handle_event`] or
//! the [`Informer::apply`], [`Informer::delete`] and [`Informer::replace`]
//! shorthands; the informer updates its store and invokes every registered
//! [`EventHandler`] synchronously on the caller's task.
//!
//! Handlers must not block: they run on the dispatch path of every event.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

use crate::selector::PodSelector;

/// Errors from reading the local cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0} cache has not synced")]
    NotSynced(String),

    #[error("timed out after {elapsed:?} waiting for {kind} cache to sync")]
    SyncTimeout { kind: String, elapsed: Duration },
}

/// Receives change notifications for one kind of object.
///
/// Periodic resyncs arrive as `on_update` with identical old and new objects.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &K) {}

    fn on_update(&self, _old: &K, _new: &K) {}

    fn on_delete(&self, _obj: &K) {}
}

/// Indexed pod lookup.
pub trait PodLister: Send + Sync {
    /// Pods in `namespace` whose labels satisfy `selector`.
    fn list(&self, namespace: &str, selector: &PodSelector) -> Result<Vec<Arc<Pod>>, CacheError>;

    /// A single cached pod.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;
}

/// Eventually consistent local mirror of one object kind.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: String,
    reader: Store<K>,
    writer: Mutex<Writer<K>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (reader, writer) = reflector::store();
        Self {
            kind: K::kind(&()).to_string(),
            reader,
            writer: Mutex::new(writer),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Register a handler. Objects already cached are not replayed.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.write().push(handler);
    }

    /// Apply one watch event to the store and notify handlers.
    ///
    /// Relisted objects are buffered by the store until `InitDone`, which
    /// swaps them in, marks the cache synced and dispatches the difference
    /// against the previous contents.
    pub fn handle_event(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj),
            watcher::Event::Delete(obj) => self.delete(&obj),
            watcher::Event::InitDone => self.finish_relist(),
            event @ (watcher::Event::Init | watcher::Event::InitApply(_)) => {
                self.writer.lock().apply_watcher_event(&event);
            }
        }
    }

    /// Insert or replace an object and notify handlers.
    pub fn apply(&self, obj: K) {
        let key = ObjectRef::from_obj(&obj);
        let (old, new) = {
            let mut writer = self.writer.lock();
            let old = self.reader.get(&key);
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
            (old, self.reader.get(&key))
        };
        let Some(new) = new else {
            return;
        };

        trace!(kind = %self.kind, key = %key, "Cache apply");
        for handler in self.handlers() {
            match &old {
                Some(old) => handler.on_update(old, &new),
                None => handler.on_add(&new),
            }
        }
    }

    /// Remove an object and notify handlers.
    pub fn delete(&self, obj: &K) {
        let key = ObjectRef::from_obj(obj);
        let old = {
            let mut writer = self.writer.lock();
            let Some(old) = self.reader.get(&key) else {
                return;
            };
            writer.apply_watcher_event(&watcher::Event::Delete(obj.clone()));
            old
        };

        trace!(kind = %self.kind, key = %key, "Cache delete");
        for handler in self.handlers() {
            handler.on_delete(&old);
        }
    }

    /// Replace the whole store with a fresh listing and mark the cache synced.
    pub fn replace(&self, objs: Vec<K>) {
        self.handle_event(watcher::Event::Init);
        for obj in objs {
            self.handle_event(watcher::Event::InitApply(obj));
        }
        self.handle_event(watcher::Event::InitDone);
    }

    fn finish_relist(&self) {
        let (mut previous, current) = {
            let mut writer = self.writer.lock();
            let previous: HashMap<ObjectRef<K>, Arc<K>> = self
                .reader
                .state()
                .into_iter()
                .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                .collect();
            writer.apply_watcher_event(&watcher::Event::InitDone);
            (previous, self.reader.state())
        };

        let handlers = self.handlers();
        let count = current.len();
        let mut changes = Vec::with_capacity(count);
        for new in current {
            changes.push((previous.remove(&ObjectRef::from_obj(new.as_ref())), new));
        }

        let removed = previous.len();
        for old in previous.into_values() {
            for handler in &handlers {
                handler.on_delete(&old);
            }
        }
        for (old, new) in &changes {
            for handler in &handlers {
                match old {
                    Some(old) => handler.on_update(old, new),
                    None => handler.on_add(new),
                }
            }
        }

        debug!(kind = %self.kind, count, removed, "Cache relisted");
    }

    /// Re-deliver every cached object to handlers as an update.
    pub fn resync(&self) {
        let objs = self.list();
        trace!(kind = %self.kind, count = objs.len(), "Cache resync");

        let handlers = self.handlers();
        for obj in &objs {
            for handler in &handlers {
                handler.on_update(obj, obj);
            }
        }
    }

    pub fn get(&self, key: &ObjectRef<K>) -> Option<Arc<K>> {
        self.reader.get(key)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.reader.state()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn has_synced(&self) -> bool {
        matches!(self.reader.wait_until_ready().now_or_never(), Some(Ok(())))
    }

    /// Wait until the first full listing has been applied.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), CacheError> {
        let ready = tokio::time::timeout(timeout, self.reader.wait_until_ready()).await;
        match ready {
            Ok(Ok(())) => Ok(()),
            _ => Err(CacheError::SyncTimeout {
                kind: self.kind.clone(),
                elapsed: timeout,
            }),
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers.read().clone()
    }
}

impl<K> Default for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl PodLister for Informer<Pod> {
    fn list(&self, namespace: &str, selector: &PodSelector) -> Result<Vec<Arc<Pod>>, CacheError> {
        if !self.has_synced() {
            return Err(CacheError::NotSynced(self.kind.clone()));
        }

        let no_labels = BTreeMap::new();
        Ok(self
            .reader
            .state()
            .into_iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| selector.matches(pod.metadata.labels.as_ref().unwrap_or(&no_labels)))
            .collect())
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.reader.get(&ObjectRef::new(name).within(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use parking_lot::Mutex;

    fn key(obj: &ConfigMap) -> String {
        format!(
            "{}/{}",
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            obj.metadata.name.as_deref().unwrap_or_default()
        )
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EventHandler<ConfigMap> for Recorder {
        fn on_add(&self, obj: &ConfigMap) {
            self.events.lock().push(format!("add {}", key(obj)));
        }

        fn on_update(&self, _old: &ConfigMap, new: &ConfigMap) {
            self.events.lock().push(format!("update {}", key(new)));
        }

        fn on_delete(&self, obj: &ConfigMap) {
            self.events.lock().push(format!("delete {}", key(obj)));
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("testing".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("testing".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_dispatch_add_update_delete() {
        let informer = Informer::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());

        informer.apply(config_map("a"));
        informer.apply(config_map("a"));
        informer.delete(&config_map("a"));
        informer.delete(&config_map("a"));

        assert_eq!(
            *recorder.events.lock(),
            vec!["add testing/a", "update testing/a", "delete testing/a"]
        );
        assert!(informer.is_empty());
    }

    #[test]
    fn test_replace_removes_stale_and_marks_synced() {
        let informer = Informer::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());

        informer.apply(config_map("stale"));
        assert!(!informer.has_synced());

        informer.replace(vec![config_map("fresh")]);

        assert!(informer.has_synced());
        assert_eq!(informer.len(), 1);
        assert!(informer.get(&ObjectRef::new("fresh").within("testing")).is_some());
        assert!(recorder
            .events
            .lock()
            .contains(&"delete testing/stale".to_string()));
    }

    #[test]
    fn test_resync_redelivers_as_update() {
        let informer = Informer::<ConfigMap>::new();
        informer.replace(vec![config_map("a"), config_map("b")]);

        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        informer.resync();

        let mut events = recorder.events.lock().clone();
        events.sort();
        assert_eq!(events, vec!["update testing/a", "update testing/b"]);
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let informer = Informer::<ConfigMap>::new();
        assert!(informer.wait_synced(Duration::from_millis(10)).await.is_err());

        informer.replace(Vec::new());
        assert!(informer.wait_synced(Duration::from_millis(10)).await.is_ok());
    }

    #[test]
    fn test_watch_events_relist_through_store() {
        let informer = Informer::<ConfigMap>::new();
        let recorder = Arc::new(Recorder::default());
        informer.add_handler(recorder.clone());
        informer.apply(config_map("kept"));
        informer.apply(config_map("gone"));

        informer.handle_event(watcher::Event::Init);
        informer.handle_event(watcher::Event::InitApply(config_map("kept")));
        informer.handle_event(watcher::Event::InitApply(config_map("new")));
        // Buffered until the relist completes.
        assert!(!informer.has_synced());
        assert_eq!(informer.len(), 2);

        informer.handle_event(watcher::Event::InitDone);
        assert!(informer.has_synced());
        assert_eq!(informer.len(), 2);

        let mut events = recorder.events.lock().clone();
        events.sort();
        assert_eq!(
            events,
            vec![
                "add testing/gone",
                "add testing/kept",
                "add testing/new",
                "delete testing/gone",
                "update testing/kept",
            ]
        );
    }

    #[test]
    fn test_pod_lister_filters_namespace_and_labels() {
        let informer = Informer::<Pod>::new();
        let selector = PodSelector::from_label_selector(&LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            match_expressions: None,
        })
        .unwrap();

        assert!(PodLister::list(&informer, "testing", &selector).is_err());

        let mut elsewhere = pod("web-other-ns", "web");
        elsewhere.metadata.namespace = Some("other".to_string());
        informer.replace(vec![pod("web-1", "web"), pod("db-1", "db"), elsewhere]);

        let pods = PodLister::list(&informer, "testing", &selector).unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name.as_deref(), Some("web-1"));
        assert!(PodLister::get(&informer, "testing", "db-1").is_some());
        assert!(PodLister::get(&informer, "testing", "missing").is_none());
    }
}
