//! Deployment event filter.
//!
//! Turns deployment notifications into eviction keys. Each pass is a pure
//! decision over the deployment snapshot, the cached pods and one read of the
//! policy; it never talks to the API server and tolerates redundant calls
//! from resyncs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use pod_refresh_workqueue::WorkQueue;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::informer::{EventHandler, PodLister};
use crate::policy::PolicyStore;
use crate::selector::PodSelector;
use crate::task::PodKey;

const CONDITION_AVAILABLE: &str = "Available";
const CONDITION_PROGRESSING: &str = "Progressing";
const REASON_NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

/// Health of a deployment as reported by its status conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// `Available` is missing or not `True`.
    Unavailable { status: Option<String> },
    /// `Progressing` is present but the rollout has not settled.
    RollingOut {
        status: String,
        reason: Option<String>,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Evaluate a deployment's status conditions.
pub fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();
    let find = |type_: &str| conditions.iter().find(|c| c.type_ == type_);

    let available = find(CONDITION_AVAILABLE).map(|c| c.status.as_str());
    if available != Some("True") {
        return Readiness::Unavailable {
            status: available.map(str::to_string),
        };
    }

    if let Some(progressing) = find(CONDITION_PROGRESSING) {
        let settled = progressing.status == "True"
            && progressing.reason.as_deref() == Some(REASON_NEW_REPLICA_SET_AVAILABLE);
        if !settled {
            return Readiness::RollingOut {
                status: progressing.status.clone(),
                reason: progressing.reason.clone(),
            };
        }
    }

    Readiness::Ready
}

/// Matches pod names generated for the controller's own deployment:
/// `<deployment>-<replica set hash>-<pod suffix>`.
fn own_pod_pattern(deployment_name: &str) -> Option<Regex> {
    let pattern = format!("^{}-[a-z0-9]+-[a-z0-9]+$", regex::escape(deployment_name));
    Regex::new(&pattern).ok()
}

/// Whether `deployment_name` is the deployment running this controller.
pub fn is_controller_deployment(own_pod_name: &str, deployment_name: &str) -> bool {
    own_pod_pattern(deployment_name).is_some_and(|re| re.is_match(own_pod_name))
}

/// Whether `pod` has been alive for longer than `threshold` at `now`.
///
/// Pods without a creation timestamp, or created in the future relative to
/// `now`, are never expired.
pub fn is_pod_expired(pod: &Pod, threshold: Duration, now: DateTime<Utc>) -> bool {
    let Some(created) = pod.metadata.creation_timestamp.as_ref() else {
        return false;
    };

    match (now - created.0).to_std() {
        Ok(age) => age > threshold,
        Err(_) => false,
    }
}

/// Deployment handler that enqueues expired pods for eviction.
pub struct DeploymentFilter {
    own_pod_name: String,
    policy: Arc<PolicyStore>,
    pods: Arc<dyn PodLister>,
    queue: WorkQueue<PodKey>,
}

impl DeploymentFilter {
    pub fn new(
        own_pod_name: impl Into<String>,
        policy: Arc<PolicyStore>,
        pods: Arc<dyn PodLister>,
        queue: WorkQueue<PodKey>,
    ) -> Self {
        Self {
            own_pod_name: own_pod_name.into(),
            policy,
            pods,
            queue,
        }
    }

    /// Run one filter pass and return the number of keys submitted.
    pub fn reconcile(&self, deployment: &Deployment) -> usize {
        self.reconcile_at(deployment, Utc::now())
    }

    fn reconcile_at(&self, deployment: &Deployment, now: DateTime<Utc>) -> usize {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let Some(namespace) = deployment.metadata.namespace.as_deref() else {
            error!(deployment = %name, "Deployment has no namespace");
            return 0;
        };

        if is_controller_deployment(&self.own_pod_name, name) {
            debug!(deployment = %name, "Skipping own deployment");
            return 0;
        }

        match deployment_readiness(deployment) {
            Readiness::Ready => {}
            Readiness::Unavailable { status } => {
                info!(deployment = %name, available = ?status, "Deployment is not available");
                return 0;
            }
            Readiness::RollingOut { status, reason } => {
                info!(
                    deployment = %name,
                    progressing = %status,
                    reason = ?reason,
                    "Deployment rollout has not settled"
                );
                return 0;
            }
        }

        let selector = match deployment.spec.as_ref() {
            Some(spec) => match PodSelector::from_label_selector(&spec.selector) {
                Ok(selector) => selector,
                Err(e) => {
                    error!(deployment = %name, error = %e, "Invalid pod selector");
                    return 0;
                }
            },
            None => PodSelector::nothing(),
        };
        if selector.selects_all() {
            warn!(deployment = %name, "Deployment selector matches every pod, skipping");
            return 0;
        }

        let pods = match self.pods.list(namespace, &selector) {
            Ok(pods) => pods,
            Err(e) => {
                warn!(deployment = %name, error = %e, "Listing pods failed");
                return 0;
            }
        };

        let threshold = self.policy.expiration_threshold();
        let mut submitted = 0;
        for pod in pods.iter().filter(|p| is_pod_expired(p, threshold, now)) {
            match PodKey::for_pod(pod) {
                Ok(key) => {
                    debug!(deployment = %name, pod = %key, "Pod expired, enqueueing eviction");
                    self.queue.add(key);
                    submitted += 1;
                }
                Err(e) => {
                    error!(deployment = %name, error = %e, "Cannot derive pod key");
                }
            }
        }

        if submitted > 0 {
            info!(
                deployment = %name,
                selector = %selector,
                threshold = ?threshold,
                submitted,
                "Expired pods enqueued"
            );
        }
        submitted
    }
}

impl EventHandler<Deployment> for DeploymentFilter {
    fn on_update(&self, _old: &Deployment, new: &Deployment) {
        self.reconcile(new);
    }
}
