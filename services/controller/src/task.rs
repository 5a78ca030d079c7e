//! Eviction task keys.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Errors deriving a pod key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,

    #[error("object {0} has no namespace")]
    MissingNamespace(String),
}

/// Identity of one pod to evict; the work queue deduplicates on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key for a cached pod.
    pub fn for_pod(pod: &Pod) -> Result<Self, KeyError> {
        let name = pod
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(KeyError::MissingName)?;
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| KeyError::MissingNamespace(name.to_string()))?;

        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
