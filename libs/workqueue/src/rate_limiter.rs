//! Backoff strategies for re-queued keys.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::QueueKey;

/// Default first retry delay for a failing key.
pub const DEFAULT_ITEM_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for a single key's retry delay.
pub const DEFAULT_ITEM_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default jitter factor (0.0 to 1.0) applied to per-key delays.
pub const DEFAULT_ITEM_JITTER: f64 = 0.1;

/// Default overall admission rate, in keys per second.
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Default overall burst size.
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Decides how long a key waits before it is re-queued.
pub trait RateLimiter<K>: Send + Sync {
    /// Record one more failure for `key` and return the delay to wait.
    fn when(&self, key: &K) -> Duration;

    /// Drop all failure history for `key`.
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

// =============================================================================
// Per-key exponential backoff
// =============================================================================

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
///
/// Jitter shortens each delay by up to `jitter * delay` so that keys which
/// failed together do not retry in lockstep. The cap is never exceeded.
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    jitter: f64,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: QueueKey> ItemExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the given zero-based attempt, before jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl<K: QueueKey> Default for ItemExponentialRateLimiter<K> {
    fn default() -> Self {
        Self::new(
            DEFAULT_ITEM_BASE_DELAY,
            DEFAULT_ITEM_MAX_DELAY,
            DEFAULT_ITEM_JITTER,
        )
    }
}

impl<K: QueueKey> RateLimiter<K> for ItemExponentialRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let attempt = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };

        let delay = self.backoff(attempt);
        if self.jitter == 0.0 {
            return delay;
        }

        let shrink = rand::rng().random::<f64>() * self.jitter;
        delay.mul_f64(1.0 - shrink)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// =============================================================================
// Overall token bucket
// =============================================================================

/// Token bucket shared by all keys; bounds the total retry rate.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_QPS, DEFAULT_BUCKET_BURST)
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // Reserve a token even when the bucket is empty; the debt is paid by waiting.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // A vanishing qps makes the wait unrepresentable.
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

// =============================================================================
// Composition
// =============================================================================

/// Applies every child limiter and waits for the slowest.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn default_controller_rate_limiter<K: QueueKey>() -> MaxOfRateLimiter<K> {
    let limiters: Vec<Box<dyn RateLimiter<K>>> = vec![
        Box::new(ItemExponentialRateLimiter::<K>::default()),
        Box::new(BucketRateLimiter::default()),
    ];
    MaxOfRateLimiter::new(limiters)
}
