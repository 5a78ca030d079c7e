//! Lease lock abstraction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from reading or writing the lease object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// The lease changed since it was read, or already exists on create.
    #[error("lease was modified concurrently")]
    Conflict,

    #[error("lease request failed: {0}")]
    Api(String),
}

/// Contents of the lease object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
}

impl LeaseRecord {
    /// Whether `identity` is recorded as the holder.
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    /// Whether nobody holds the lease.
    pub fn is_vacant(&self) -> bool {
        self.holder_identity.as_deref().is_none_or(str::is_empty)
    }
}

/// A lease record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaseRecord,
    pub version: String,
}

/// Compare-and-swap access to a single lease object.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Read the lease, `None` if it does not exist.
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError>;

    /// Create the lease. Fails with [`LeaseError::Conflict`] if it exists.
    async fn create(&self, record: &LeaseRecord) -> Result<VersionedRecord, LeaseError>;

    /// Replace the lease if it is still at `current.version`.
    async fn update(
        &self,
        current: &VersionedRecord,
        record: &LeaseRecord,
    ) -> Result<VersionedRecord, LeaseError>;

    /// Human-readable lock name for logs.
    fn describe(&self) -> String;
}

/// In-process lease shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryLease {
    inner: Arc<MemoryLeaseInner>,
}

#[derive(Default)]
struct MemoryLeaseInner {
    record: Mutex<Option<VersionedRecord>>,
    version: AtomicU64,
    failing: AtomicBool,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail with [`LeaseError::Api`] until reset.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Current record, bypassing failure injection.
    pub fn snapshot(&self) -> Option<LeaseRecord> {
        self.inner.record.lock().as_ref().map(|v| v.record.clone())
    }

    fn check(&self) -> Result<(), LeaseError> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(LeaseError::Api("injected failure".into()));
        }
        Ok(())
    }

    fn next_version(&self) -> String {
        (self.inner.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl LeaseLock for MemoryLease {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
        self.check()?;
        Ok(self.inner.record.lock().clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<VersionedRecord, LeaseError> {
        self.check()?;
        let mut stored = self.inner.record.lock();
        if stored.is_some() {
            return Err(LeaseError::Conflict);
        }
        let versioned = VersionedRecord {
            record: record.clone(),
            version: self.next_version(),
        };
        *stored = Some(versioned.clone());
        Ok(versioned)
    }

    async fn update(
        &self,
        current: &VersionedRecord,
        record: &LeaseRecord,
    ) -> Result<VersionedRecord, LeaseError> {
        self.check()?;
        let mut stored = self.inner.record.lock();
        match stored.as_ref() {
            Some(existing) if existing.version == current.version => {}
            _ => return Err(LeaseError::Conflict),
        }
        let versioned = VersionedRecord {
            record: record.clone(),
            version: self.next_version(),
        };
        *stored = Some(versioned.clone());
        Ok(versioned)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_by(identity: &str) -> LeaseRecord {
        LeaseRecord {
            holder_identity: Some(identity.to_string()),
            lease_duration: Duration::from_secs(15),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_lease_cas() {
        let lease = MemoryLease::new();
        assert!(lease.get().await.unwrap().is_none());

        let first = lease.create(&held_by("a")).await.unwrap();
        assert_eq!(lease.create(&held_by("b")).await, Err(LeaseError::Conflict));

        let second = lease.update(&first, &held_by("b")).await.unwrap();
        assert_ne!(first.version, second.version);

        // A stale version loses.
        assert_eq!(lease.update(&first, &held_by("c")).await, Err(LeaseError::Conflict));
        assert!(lease.snapshot().unwrap().is_held_by("b"));
    }

    #[tokio::test]
    async fn test_memory_lease_failure_injection() {
        let lease = MemoryLease::new();
        lease.set_failing(true);
        assert!(matches!(lease.get().await, Err(LeaseError::Api(_))));

        lease.set_failing(false);
        assert!(lease.get().await.is_ok());
    }

    #[test]
    fn test_record_vacancy() {
        assert!(LeaseRecord::default().is_vacant());
        assert!(LeaseRecord {
            holder_identity: Some(String::new()),
            ..Default::default()
        }
        .is_vacant());
        assert!(!held_by("a").is_vacant());
    }
}
