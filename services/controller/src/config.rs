//! Controller configuration (env-driven).

use std::time::Duration;

use thiserror::Error;

use crate::controller::ControllerConfig;
use crate::duration::{parse_duration, DurationError};
use crate::leader::{
    ElectionConfigError, LeaderElectionConfig, DEFAULT_LEASE_DURATION, DEFAULT_RENEW_DEADLINE,
    DEFAULT_RETRY_PERIOD,
};
use crate::policy::DEFAULT_CONFIG_MAP_NAME;
use crate::worker::default_worker_count;

/// Default lease object name.
pub const DEFAULT_LEASE_NAME: &str = "pod-refresh-controller";

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(2 * 60);

pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is not a valid duration: {source}")]
    Duration {
        var: &'static str,
        #[source]
        source: DurationError,
    },

    #[error("{var} must be a positive integer, got {value:?}")]
    Integer { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },

    #[error("invalid leader election settings: {0}")]
    Election(#[from] ElectionConfigError),
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Own pod name: lease identity and self-exclusion base.
    pub pod_name: String,

    /// Namespace to watch and hold the lease in.
    pub namespace: String,

    /// Use the local kubeconfig instead of the in-cluster service account.
    pub local: bool,

    /// Name of the config object carrying the refresh policy.
    pub config_map_name: String,

    pub lease_name: String,

    /// Interval between full cache resyncs.
    pub resync_period: Duration,

    /// Number of eviction workers.
    pub workers: usize,

    /// How long to wait for the initial cache listing.
    pub cache_sync_timeout: Duration,

    pub election: LeaderElectionConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(var))
        };
        let duration = |var: &'static str, default: Duration| match lookup(var) {
            Some(raw) => parse_duration(raw.trim()).map_err(|source| ConfigError::Duration { var, source }),
            None => Ok(default),
        };

        let pod_name = required("POD_NAME")?;
        let namespace = required("POD_NAMESPACE")?;
        let local = lookup("ENABLE_LOCAL_CONFIG").is_some();

        let config_map_name = lookup("CONFIG_MAP_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_MAP_NAME.to_string());
        let lease_name = lookup("LEASE_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string());

        let resync_period = duration("RESYNC_PERIOD", DEFAULT_RESYNC_PERIOD)?;
        if resync_period.is_zero() {
            return Err(ConfigError::Zero { var: "RESYNC_PERIOD" });
        }
        let cache_sync_timeout = duration("CACHE_SYNC_TIMEOUT", DEFAULT_CACHE_SYNC_TIMEOUT)?;

        let workers = match lookup("WORKER_COUNT") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => return Err(ConfigError::Zero { var: "WORKER_COUNT" }),
                Ok(n) => n,
                Err(_) => {
                    return Err(ConfigError::Integer {
                        var: "WORKER_COUNT",
                        value: raw,
                    })
                }
            },
            None => default_worker_count(),
        };

        let election = LeaderElectionConfig {
            identity: pod_name.clone(),
            lease_duration: duration("LEASE_DURATION", DEFAULT_LEASE_DURATION)?,
            renew_deadline: duration("RENEW_DEADLINE", DEFAULT_RENEW_DEADLINE)?,
            retry_period: duration("RETRY_PERIOD", DEFAULT_RETRY_PERIOD)?,
            release_on_cancel: true,
        };
        election.validate()?;

        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            pod_name,
            namespace,
            local,
            config_map_name,
            lease_name,
            resync_period,
            workers,
            cache_sync_timeout,
            election,
            log_level,
        })
    }

    /// Settings for the leader-scoped controller run.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            own_pod_name: self.pod_name.clone(),
            resync_period: self.resync_period,
            workers: self.workers,
            cache_sync_timeout: self.cache_sync_timeout,
        }
    }
}
