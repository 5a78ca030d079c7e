//! Work queue primitives for controller retry loops.
//!
//! The queue hands keys to a pool of workers and guarantees:
//!
//! - **Deduplication**: a key is stored at most once while it waits.
//! - **Serialization**: a key handed to a worker is never handed to a second
//!   worker until the first calls [`WorkQueue::done`]. Re-adds during that
//!   window are parked and re-queued on `done`.
//! - **Rate limiting**: failed keys come back after a per-key backoff chosen
//!   by a pluggable [`RateLimiter`].
//!
//! ```text
//! add() ──► dirty set ──► FIFO ──► get() ──► processing set ──► done()
//!              ▲                                                  │
//!              └──────────── add_rate_limited() ◄── failure ──────┘
//! ```

use std::fmt::Debug;
use std::hash::Hash;

mod queue;
mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialRateLimiter,
    MaxOfRateLimiter, RateLimiter, DEFAULT_BUCKET_BURST, DEFAULT_BUCKET_QPS, DEFAULT_ITEM_BASE_DELAY,
    DEFAULT_ITEM_JITTER, DEFAULT_ITEM_MAX_DELAY,
};

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}
