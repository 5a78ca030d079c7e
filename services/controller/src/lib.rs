//! Pod refresh controller.
//!
//! Evicts pods that have outlived a configurable age so that their
//! deployment replaces them with pods built from current configuration.
//!
//! Components:
//! - [`leader`]: lease-based election; only the leader runs the pipeline.
//! - [`policy`]: hot-reloadable expiration threshold from a config object.
//! - [`filter`]: turns deployment notifications into eviction keys.
//! - [`worker`]: drains the retry queue and issues evictions.
//! - [`informer`]: local watch caches fed by [`k8s`] watchers.
//!
//! ```text
//! Lease ──► LeaderElector ──► Controller::run
//!                                │
//!   config watch ──► PolicyStore │
//!                        │ threshold
//!   deployment watch ──► DeploymentFilter ──► WorkQueue ──► WorkerPool ──► Evictor
//!   pod watch ─────────────────┘ (lister)
//! ```

pub mod config;
pub mod controller;
pub mod duration;
pub mod filter;
pub mod informer;
pub mod k8s;
pub mod leader;
pub mod policy;
pub mod selector;
pub mod task;
pub mod worker;

pub use config::{Config, ConfigError};
pub use controller::{Controller, ControllerConfig, ControllerError, Informers};
pub use filter::DeploymentFilter;
pub use informer::{EventHandler, Informer, PodLister};
pub use leader::{ElectionState, LeaderElectionConfig, LeaderElector};
pub use policy::{Policy, PolicyStore};
pub use task::PodKey;
pub use worker::{EvictionError, Evictor, WorkerPool};
