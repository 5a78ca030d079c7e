//! Hot-reloadable refresh policy.
//!
//! The policy lives in a single config object in the controller's namespace.
//! Its `podExpirationTime` field is a duration literal; the [`PolicyStore`]
//! parses it on every add/update notification and swaps in a new immutable
//! [`Policy`] when the value changes.
//!
//! - Readers take lock-free snapshots and never observe a partial update.
//! - A value that fails to parse is logged and ignored; the last good value
//!   (or the default) stays in effect.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::ConfigMap;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::duration::{parse_duration, DurationError};
use crate::informer::EventHandler;

/// Default name of the watched config object.
pub const DEFAULT_CONFIG_MAP_NAME: &str = "pod-refresh-controller";

/// Config key holding the expiration threshold.
pub const POD_EXPIRATION_TIME_KEY: &str = "podExpirationTime";

/// Threshold used until a config object supplies one.
pub const DEFAULT_POD_EXPIRATION_TIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("config object has no podExpirationTime key")]
    MissingKey,

    #[error("parsing podExpirationTime: {0}")]
    InvalidDuration(#[from] DurationError),
}

/// Refresh policy in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Pods older than this are evicted.
    pub expiration_threshold: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            expiration_threshold: DEFAULT_POD_EXPIRATION_TIME,
        }
    }
}

/// Single-writer, multi-reader holder of the current [`Policy`].
pub struct PolicyStore {
    config_map_name: String,
    current: ArcSwap<Policy>,
}

impl PolicyStore {
    /// Create a store holding the default policy.
    pub fn new(config_map_name: impl Into<String>) -> Self {
        Self {
            config_map_name: config_map_name.into(),
            current: ArcSwap::from_pointee(Policy::default()),
        }
    }

    /// Consistent snapshot of the current policy.
    pub fn snapshot(&self) -> Arc<Policy> {
        self.current.load_full()
    }

    pub fn expiration_threshold(&self) -> Duration {
        self.current.load().expiration_threshold
    }

    /// Apply a raw `podExpirationTime` value.
    ///
    /// Returns whether the policy changed.
    pub fn update_expiration_time(&self, raw: &str) -> Result<bool, PolicyError> {
        let threshold = parse_duration(raw.trim())?;

        if self.current.load().expiration_threshold == threshold {
            debug!(threshold = ?threshold, "Pod expiration time unchanged");
            return Ok(false);
        }

        self.current.store(Arc::new(Policy {
            expiration_threshold: threshold,
        }));
        info!(threshold = ?threshold, "Pod expiration time updated");
        Ok(true)
    }

    /// Apply the policy carried by a config object.
    pub fn apply_config_map(&self, config_map: &ConfigMap) -> Result<bool, PolicyError> {
        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(POD_EXPIRATION_TIME_KEY))
            .ok_or(PolicyError::MissingKey)?;

        self.update_expiration_time(raw)
    }

    fn handle(&self, config_map: &ConfigMap) {
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        if name != self.config_map_name {
            debug!(config_map = %name, "Ignoring unrelated config object");
            return;
        }

        if let Err(e) = self.apply_config_map(config_map) {
            error!(
                config_map = %name,
                error = %e,
                threshold = ?self.expiration_threshold(),
                "Invalid refresh policy, keeping current threshold"
            );
        }
    }
}

impl EventHandler<ConfigMap> for PolicyStore {
    fn on_add(&self, obj: &ConfigMap) {
        self.handle(obj);
    }

    fn on_update(&self, _old: &ConfigMap, new: &ConfigMap) {
        self.handle(new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(name: &str, value: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("testing".to_string()),
                ..Default::default()
            },
            data: value.map(|v| BTreeMap::from([(POD_EXPIRATION_TIME_KEY.to_string(), v.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_policy() {
        let store = PolicyStore::new(DEFAULT_CONFIG_MAP_NAME);
        assert_eq!(store.expiration_threshold(), Duration::from_secs(24 * 3600));
        assert_eq!(*store.snapshot(), Policy::default());
    }

    #[test]
    fn test_update_changes_threshold() {
        let store = PolicyStore::new(DEFAULT_CONFIG_MAP_NAME);

        assert!(store.update_expiration_time("1h").unwrap());
        assert_eq!(store.expiration_threshold(), Duration::from_secs(3600));

        // Same value again is not a change.
        assert!(!store.update_expiration_time("60m").unwrap());
    }

    #[test]
    fn test_malformed_value_keeps_last_good() {
        let store = PolicyStore::new(DEFAULT_CONFIG_MAP_NAME);
        store.update_expiration_time("1h").unwrap();

        assert!(store.update_expiration_time("notaduration").is_err());
        assert!(store.update_expiration_time("").is_err());
        assert!(store.update_expiration_time("-5m").is_err());
        assert_eq!(store.expiration_threshold(), Duration::from_secs(3600));
    }

    #[test]
    fn test_handler_applies_named_config_map_only() {
        let store = PolicyStore::new(DEFAULT_CONFIG_MAP_NAME);

        store.on_add(&config_map("unrelated", Some("5m")));
        assert_eq!(store.expiration_threshold(), DEFAULT_POD_EXPIRATION_TIME);

        store.on_add(&config_map(DEFAULT_CONFIG_MAP_NAME, Some("2h")));
        assert_eq!(store.expiration_threshold(), Duration::from_secs(7200));

        let old = config_map(DEFAULT_CONFIG_MAP_NAME, Some("2h"));
        store.on_update(&old, &config_map(DEFAULT_CONFIG_MAP_NAME, None));
        assert_eq!(store.expiration_threshold(), Duration::from_secs(7200));

        store.on_update(&old, &config_map(DEFAULT_CONFIG_MAP_NAME, Some("30m")));
        assert_eq!(store.expiration_threshold(), Duration::from_secs(1800));
    }

    #[test]
    fn test_snapshot_is_stable_across_updates() {
        let store = PolicyStore::new(DEFAULT_CONFIG_MAP_NAME);
        let before = store.snapshot();

        store.update_expiration_time("1m").unwrap();

        assert_eq!(before.expiration_threshold, DEFAULT_POD_EXPIRATION_TIME);
        assert_eq!(store.snapshot().expiration_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let store = Arc::new(PolicyStore::new(DEFAULT_CONFIG_MAP_NAME));
        let valid = [DEFAULT_POD_EXPIRATION_TIME, Duration::from_secs(60), Duration::from_secs(3600)];

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        let threshold = store.expiration_threshold();
                        assert!(valid.contains(&threshold));
                    }
                })
            })
            .collect();

        for i in 0..1_000 {
            let raw = if i % 2 == 0 { "1m" } else { "1h" };
            store.update_expiration_time(raw).unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
