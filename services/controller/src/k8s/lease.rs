//! `coordination.k8s.io/v1` Lease backed [`LeaseLock`].

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};

use crate::leader::{LeaseError, LeaseLock, LeaseRecord, VersionedRecord};

pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.into(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, resource_version: Option<String>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(duration_seconds(record.lease_duration)),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }
}

fn duration_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs().max(1)).unwrap_or(i32::MAX)
}

fn to_versioned(lease: Lease) -> Result<VersionedRecord, LeaseError> {
    let version = lease
        .metadata
        .resource_version
        .ok_or_else(|| LeaseError::Api("lease has no resourceVersion".into()))?;
    let spec = lease.spec.unwrap_or_default();

    Ok(VersionedRecord {
        record: LeaseRecord {
            holder_identity: spec.holder_identity,
            lease_duration: Duration::from_secs(
                spec.lease_duration_seconds.unwrap_or_default().max(0) as u64,
            ),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            lease_transitions: spec.lease_transitions.unwrap_or_default(),
        },
        version,
    })
}

fn classify(err: kube::Error) -> LeaseError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => LeaseError::Conflict,
        other => LeaseError::Api(other.to_string()),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
        match self.api.get_opt(&self.name).await.map_err(classify)? {
            Some(lease) => to_versioned(lease).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedRecord, LeaseError> {
        let lease = self.to_lease(record, None);
        let created = self
            .api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(classify)?;
        to_versioned(created)
    }

    async fn update(
        &self,
        current: &VersionedRecord,
        record: &LeaseRecord,
    ) -> Result<VersionedRecord, LeaseError> {
        let lease = self.to_lease(record, Some(current.version.clone()));
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(classify)?;
        to_versioned(replaced)
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
