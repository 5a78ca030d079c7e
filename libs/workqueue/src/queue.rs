//! Deduplicating FIFO with in-flight tracking and delayed re-adds.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use crate::QueueKey;

/// A concurrent-safe, deduplicating, rate-limited work queue.
///
/// Cloning is cheap; all clones share the same queue.
pub struct WorkQueue<K: QueueKey> {
    inner: Arc<Inner<K>>,
}

struct Inner<K: QueueKey> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    /// Wakes delayed re-adds on shutdown.
    stopped: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

struct State<K> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<K>,

    /// Keys that need processing: everything in `queue`, plus keys re-added
    /// while they were being processed.
    dirty: HashSet<K>,

    /// Keys currently held by a worker.
    processing: HashSet<K>,

    shutting_down: bool,
}

impl<K: QueueKey> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue with the given backoff strategy.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                stopped: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Create a queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Mark `key` as needing processing.
    ///
    /// A key that is already waiting is coalesced. A key that is currently
    /// being processed is parked and re-queued when the worker calls
    /// [`done`](Self::done). Ignored after shutdown.
    pub fn add(&self, key: K) {
        self.inner.add(key);
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue has been shut down. The returned key is
    /// marked in-flight until [`done`](Self::done) is called for it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a concurrent add or
            // shutdown cannot slip between the check and the await.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release the in-flight marker for `key`.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-add `key` after the delay its rate limiter prescribes.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        trace!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis() as u64, "Rate limited re-add");
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has elapsed.
    ///
    /// Must be called from within a Tokio runtime when `delay` is non-zero.
    /// The pending re-add is dropped if the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let stopped = inner.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            let shutting_down = inner.state.lock().shutting_down;
            if shutting_down {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.add(key),
                _ = stopped => {}
            }
        });
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue and wake every blocked [`get`](Self::get).
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.notify.notify_waiters();
        self.inner.stopped.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<K: QueueKey> Inner<K> {
    fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}
