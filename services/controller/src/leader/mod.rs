//! Lease-based leader election.
//!
//! Replicas race for a single lease object. The winner runs the supplied
//! callback with a cancellable scope and renews the lease every retry period.
//! If it cannot renew within the renew deadline, or sees another holder, it
//! cancels the scope and reports [`ElectionState::LostLease`]; the process is
//! expected to exit so its supervisor restarts it as a fresh candidate.
//!
//! Candidates judge expiry from the time they last *observed* the record
//! change, never from the remote `renewTime`, so clock skew between replicas
//! does not matter.

mod lock;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use lock::{LeaseError, LeaseLock, LeaseRecord, MemoryLease, VersionedRecord};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Retry sleeps are stretched by up to this factor.
pub const JITTER_FACTOR: f64 = 1.2;

/// Lease duration written when a leader steps down.
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ElectionConfigError {
    #[error("leader election identity must not be empty")]
    EmptyIdentity,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("lease duration {lease_duration:?} must be greater than renew deadline {renew_deadline:?}")]
    LeaseDuration {
        lease_duration: Duration,
        renew_deadline: Duration,
    },

    #[error("renew deadline {renew_deadline:?} must be greater than 1.2 x retry period {retry_period:?}")]
    RenewDeadline {
        renew_deadline: Duration,
        retry_period: Duration,
    },
}

/// Leader election timings and identity.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Unique identity of this replica, written as the lease holder.
    pub identity: String,
    /// How long non-leaders wait after the last observed change before taking over.
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a failed renew before giving up.
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts.
    pub retry_period: Duration,
    /// Free the lease when stopping so a peer can take over immediately.
    pub release_on_cancel: bool,
}

impl LeaderElectionConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }

    pub fn validate(&self) -> Result<(), ElectionConfigError> {
        if self.identity.is_empty() {
            return Err(ElectionConfigError::EmptyIdentity);
        }
        for (name, value) in [
            ("lease duration", self.lease_duration),
            ("renew deadline", self.renew_deadline),
            ("retry period", self.retry_period),
        ] {
            if value.is_zero() {
                return Err(ElectionConfigError::Zero(name));
            }
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionConfigError::LeaseDuration {
                lease_duration: self.lease_duration,
                renew_deadline: self.renew_deadline,
            });
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(ElectionConfigError::RenewDeadline {
                renew_deadline: self.renew_deadline,
                retry_period: self.retry_period,
            });
        }
        Ok(())
    }
}

/// Where this replica stands in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Candidate,
    Leading,
    /// Renewal failed or another replica took the lease.
    LostLease,
    /// Stopped on request or because the leading callback returned.
    Released,
}

/// The record as last seen, and when it was seen.
struct Observed {
    record: Option<VersionedRecord>,
    at: Instant,
}

pub struct LeaderElector {
    config: LeaderElectionConfig,
    lock: Arc<dyn LeaseLock>,
    observed: Mutex<Observed>,
    state: watch::Sender<ElectionState>,
}

impl LeaderElector {
    pub fn new(config: LeaderElectionConfig, lock: Arc<dyn LeaseLock>) -> Result<Self, ElectionConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(ElectionState::Candidate);
        Ok(Self {
            config,
            lock,
            observed: Mutex::new(Observed {
                record: None,
                at: Instant::now(),
            }),
            state,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    /// Holder of the lease as last observed.
    pub fn observed_leader(&self) -> Option<String> {
        self.observed
            .lock()
            .record
            .as_ref()
            .and_then(|v| v.record.holder_identity.clone())
    }

    /// Campaign for the lease and run `on_started_leading` while holding it.
    ///
    /// The callback receives a scope that flips to `true` when leadership
    /// ends; it is awaited before the lease is released. Returns the terminal
    /// state, or the callback's error.
    pub async fn run<F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        on_started_leading: F,
    ) -> anyhow::Result<ElectionState>
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(
            identity = %self.config.identity,
            lease = %self.lock.describe(),
            "Starting leader election"
        );

        if !self.acquire(&mut shutdown).await {
            info!("Stopped before acquiring leadership");
            self.state.send_replace(ElectionState::Released);
            return Ok(ElectionState::Released);
        }

        self.state.send_replace(ElectionState::Leading);
        info!(identity = %self.config.identity, "Started leading");

        let (scope_tx, scope_rx) = watch::channel(false);
        let mut task = tokio::spawn(on_started_leading(scope_rx));

        let (state, callback_result) = tokio::select! {
            state = self.renew(&mut shutdown) => {
                let _ = scope_tx.send(true);
                let result = match tokio::time::timeout(self.config.renew_deadline, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Leading callback did not stop in time, aborting it");
                        task.abort();
                        Ok(Ok(()))
                    }
                };
                (state, result)
            }
            joined = &mut task => {
                info!("Leading callback returned");
                (ElectionState::Released, joined)
            }
        };

        if state == ElectionState::Released && self.config.release_on_cancel {
            match self.release().await {
                Ok(()) => info!("Released lease"),
                Err(e) => warn!(error = %e, "Failed to release lease"),
            }
        }

        self.state.send_replace(state);
        if state == ElectionState::LostLease {
            error!(identity = %self.config.identity, "Leader election lost");
        }

        match callback_result {
            Ok(Ok(())) => Ok(state),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("leading callback panicked: {e}")),
        }
    }

    /// Retry until the lease is held. Returns `false` on shutdown.
    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(leader = ?self.observed_leader(), "Lease held by another replica");
                }
                Err(e) => warn!(error = %e, "Failed to acquire lease"),
            }

            let delay = jittered(self.config.retry_period);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(shutdown) => return false,
            }
        }
    }

    /// Keep the lease until renewal fails past the deadline or shutdown.
    ///
    /// Sleeps and attempts share one budget of `renew_deadline` measured
    /// from the last successful renew, so a hanging API call cannot keep
    /// the scope open past it.
    async fn renew(&self, shutdown: &mut watch::Receiver<bool>) -> ElectionState {
        let mut last_renew = Instant::now();

        loop {
            let deadline = last_renew + self.config.renew_deadline;
            let wake = (Instant::now() + self.config.retry_period).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancelled(shutdown) => return ElectionState::Released,
            }

            let attempt = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => {
                    last_renew = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    warn!(leader = ?self.observed_leader(), "Lease taken by another replica");
                    return ElectionState::LostLease;
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to renew lease"),
                Err(_) => warn!("Lease renewal timed out"),
            }

            if Instant::now() >= deadline {
                warn!(
                    deadline = ?self.config.renew_deadline,
                    "Could not renew lease before the deadline"
                );
                return ElectionState::LostLease;
            }
        }
    }

    /// One acquire-or-renew attempt. `Ok(false)` means another replica
    /// holds an unexpired lease.
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let mut desired = LeaseRecord {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            let created = self.lock.create(&desired).await?;
            self.observe(&created);
            return Ok(true);
        };

        self.observe(&current);

        let held_by_us = current.record.is_held_by(&self.config.identity);
        if !held_by_us && !current.record.is_vacant() && !self.observed_expired() {
            return Ok(false);
        }

        if held_by_us {
            desired.acquire_time = current.record.acquire_time;
            desired.lease_transitions = current.record.lease_transitions;
        } else {
            desired.lease_transitions = current.record.lease_transitions.saturating_add(1);
        }

        let updated = self.lock.update(&current, &desired).await?;
        self.observe(&updated);
        Ok(true)
    }

    /// Record `current` and restart the expiry clock if it changed.
    fn observe(&self, current: &VersionedRecord) {
        let mut observed = self.observed.lock();
        if observed.record.as_ref() == Some(current) {
            return;
        }

        let previous = observed
            .record
            .as_ref()
            .and_then(|v| v.record.holder_identity.clone());
        let holder = current.record.holder_identity.clone();

        observed.record = Some(current.clone());
        observed.at = Instant::now();
        drop(observed);

        if holder != previous {
            if let Some(holder) = holder.filter(|h| !h.is_empty()) {
                info!(
                    leader = %holder,
                    is_self = holder == self.config.identity,
                    "New leader elected"
                );
            }
        }
    }

    fn observed_expired(&self) -> bool {
        let observed = self.observed.lock();
        let lease_duration = observed
            .record
            .as_ref()
            .map_or(Duration::ZERO, |v| v.record.lease_duration);
        observed.at + lease_duration <= Instant::now()
    }

    /// Clear the holder so a peer can take over without waiting for expiry.
    async fn release(&self) -> Result<(), LeaseError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if !current.record.is_held_by(&self.config.identity) {
            return Ok(());
        }

        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: RELEASED_LEASE_DURATION,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: current.record.lease_transitions,
        };
        let updated = self.lock.update(&current, &released).await?;
        self.observe(&updated);
        Ok(())
    }
}

/// `period` stretched by a random factor in `[1, 1 + JITTER_FACTOR)`.
fn jittered(period: Duration) -> Duration {
    period.mul_f64(1.0 + rand::rng().random::<f64>() * JITTER_FACTOR)
}

/// Resolves once `shutdown` flips to `true`; never if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use rstest::rstest;
    use tokio::sync::oneshot;

    fn config(identity: &str, lease_ms: u64, renew_ms: u64, retry_ms: u64) -> LeaderElectionConfig {
        LeaderElectionConfig {
            identity: identity.to_string(),
            lease_duration: Duration::from_millis(lease_ms),
            renew_deadline: Duration::from_millis(renew_ms),
            retry_period: Duration::from_millis(retry_ms),
            release_on_cancel: true,
        }
    }

    /// Callback that holds leadership until its scope is cancelled.
    async fn hold(mut scope: watch::Receiver<bool>) -> anyhow::Result<()> {
        let _ = scope.wait_for(|stop| *stop).await;
        Ok(())
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(LeaderElectionConfig::new("pod-a").validate().is_ok());
    }

    #[rstest]
    #[case::empty_identity(config("", 15_000, 10_000, 2_000))]
    #[case::zero_retry(config("a", 15_000, 10_000, 0))]
    #[case::lease_equals_renew(config("a", 10_000, 10_000, 2_000))]
    #[case::lease_shorter_than_renew(config("a", 5_000, 10_000, 2_000))]
    #[case::renew_equals_retry(config("a", 15_000, 2_000, 2_000))]
    #[case::renew_within_jitter(config("a", 15_000, 2_200, 2_000))]
    fn test_invalid_config(#[case] config: LeaderElectionConfig) {
        assert!(config.validate().is_err());
        assert!(LeaderElector::new(config, Arc::new(MemoryLease::new())).is_err());
    }

    #[tokio::test]
    async fn test_single_leader_among_contenders() {
        let lease = MemoryLease::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let elector =
                    LeaderElector::new(config(id, 400, 250, 50), Arc::new(lease.clone())).unwrap();
                let shutdown = shutdown_rx.clone();
                let (active, max_active, started) =
                    (active.clone(), max_active.clone(), started.clone());

                tokio::spawn(async move {
                    elector
                        .run(shutdown, move |scope| async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            let held = hold(scope).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            held
                        })
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(active.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), ElectionState::Released);
        }

        assert!(started.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_hands_over_before_expiry() {
        let lease = MemoryLease::new();
        // Long lease: the follower can only win this quickly through release.
        let first = LeaderElector::new(config("a", 10_000, 5_000, 50), Arc::new(lease.clone())).unwrap();
        let second = LeaderElector::new(config("b", 10_000, 5_000, 50), Arc::new(lease.clone())).unwrap();

        let (stop_first, first_shutdown) = watch::channel(false);
        let (leading_tx, leading_rx) = oneshot::channel();
        let first_run = tokio::spawn(async move {
            first
                .run(first_shutdown, move |scope| async move {
                    let _ = leading_tx.send(());
                    hold(scope).await
                })
                .await
        });
        leading_rx.await.unwrap();

        let (stop_second, second_shutdown) = watch::channel(false);
        let (second_tx, second_rx) = oneshot::channel();
        let second_run = tokio::spawn(async move {
            second
                .run(second_shutdown, move |scope| async move {
                    let _ = second_tx.send(());
                    hold(scope).await
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lease.snapshot().unwrap().is_held_by("a"));

        stop_first.send(true).unwrap();
        assert_eq!(first_run.await.unwrap().unwrap(), ElectionState::Released);

        tokio::time::timeout(Duration::from_secs(2), second_rx)
            .await
            .expect("follower did not take over")
            .unwrap();

        let record = lease.snapshot().unwrap();
        assert!(record.is_held_by("b"));
        assert_eq!(record.lease_transitions, 1);

        stop_second.send(true).unwrap();
        second_run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_renew_failure_loses_lease() {
        let lease = MemoryLease::new();
        let elector = LeaderElector::new(config("a", 400, 250, 50), Arc::new(lease.clone())).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (leading_tx, leading_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let observed = cancelled.clone();

        let run = tokio::spawn(async move {
            elector
                .run(shutdown_rx, move |scope| async move {
                    let _ = leading_tx.send(());
                    let held = hold(scope).await;
                    observed.fetch_add(1, Ordering::SeqCst);
                    held
                })
                .await
        });

        leading_rx.await.unwrap();
        lease.set_failing(true);

        let state = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("leader never gave up")
            .unwrap()
            .unwrap();
        assert_eq!(state, ElectionState::LostLease);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    /// Lease whose reads hang once `hang` is set.
    struct HangingLease {
        inner: MemoryLease,
        hang: AtomicBool,
        last_update: Mutex<Option<Instant>>,
    }

    #[async_trait::async_trait]
    impl LeaseLock for HangingLease {
        async fn get(&self) -> Result<Option<VersionedRecord>, LeaseError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.get().await
        }

        async fn create(&self, record: &LeaseRecord) -> Result<VersionedRecord, LeaseError> {
            self.inner.create(record).await
        }

        async fn update(
            &self,
            current: &VersionedRecord,
            record: &LeaseRecord,
        ) -> Result<VersionedRecord, LeaseError> {
            let updated = self.inner.update(current, record).await?;
            *self.last_update.lock() = Some(Instant::now());
            Ok(updated)
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    #[tokio::test]
    async fn test_hanging_renew_cancels_scope_within_deadline() {
        let lock = Arc::new(HangingLease {
            inner: MemoryLease::new(),
            hang: AtomicBool::new(false),
            last_update: Mutex::new(None),
        });
        let election = config("a", 1_100, 1_000, 400);
        let (lease_duration, renew_deadline) = (election.lease_duration, election.renew_deadline);
        let elector = LeaderElector::new(election, lock.clone()).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (leading_tx, leading_rx) = oneshot::channel();
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let run = tokio::spawn(async move {
            elector
                .run(shutdown_rx, move |scope| async move {
                    let _ = leading_tx.send(());
                    let held = hold(scope).await;
                    let _ = cancelled_tx.send(Instant::now());
                    held
                })
                .await
        });

        leading_rx.await.unwrap();
        lock.hang.store(true, Ordering::SeqCst);

        let cancelled_at = tokio::time::timeout(Duration::from_secs(3), cancelled_rx)
            .await
            .expect("scope was never cancelled")
            .unwrap();
        let last_renew = (*lock.last_update.lock()).expect("lease was never written");
        let held = cancelled_at - last_renew;
        assert!(held < lease_duration, "scope open {held:?} after last renew");
        assert!(held >= renew_deadline.saturating_sub(Duration::from_millis(50)));

        assert_eq!(run.await.unwrap().unwrap(), ElectionState::LostLease);
    }

    #[tokio::test]
    async fn test_callback_error_is_returned_and_lease_released() {
        let lease = MemoryLease::new();
        let elector = LeaderElector::new(config("a", 400, 250, 50), Arc::new(lease.clone())).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = elector
            .run(shutdown_rx, |_scope| async {
                Err::<(), _>(anyhow::anyhow!("caches never synced"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(elector.state(), ElectionState::Released);
        assert!(lease.snapshot().unwrap().is_vacant());
    }

    #[tokio::test]
    async fn test_stop_while_candidate() {
        let lease = MemoryLease::new();
        lease
            .create(&LeaseRecord {
                holder_identity: Some("other".into()),
                lease_duration: Duration::from_secs(60),
                ..Default::default()
            })
            .await
            .unwrap();

        let elector = LeaderElector::new(config("a", 400, 250, 50), Arc::new(lease.clone())).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move {
            elector
                .run(shutdown_rx, |_scope| async {
                    Err::<(), _>(anyhow::anyhow!("must not lead"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();

        assert_eq!(run.await.unwrap().unwrap(), ElectionState::Released);
        assert!(lease.snapshot().unwrap().is_held_by("other"));
    }
}
