//! Eviction through the `pods/eviction` subresource.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::EvictParams;
use kube::{Api, Client};

use crate::task::PodKey;
use crate::worker::{EvictionError, Evictor};

pub struct KubeEvictor {
    client: Client,
}

impl KubeEvictor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Evictor for KubeEvictor {
    async fn evict(&self, key: &PodKey) -> Result<(), EvictionError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        pods.evict(&key.name, &EvictParams::default())
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

fn classify(err: kube::Error) -> EvictionError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => EvictionError::NotFound,
        kube::Error::Api(resp) if resp.code == 429 => EvictionError::TooManyRequests(resp.message),
        other => EvictionError::Api(other.to_string()),
    }
}
