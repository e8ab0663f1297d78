//! Work queues and worker loops for the service catalog controller
//!
//! A [`WorkQueue`] coalesces repeated adds of the same key and never hands a
//! key to two workers at once. [`RateLimitingQueue`] adds per-key backoff,
//! and [`Worker`] drives a [`Reconcile`] implementation from a queue.

mod queue;
mod rate_limiter;
mod rate_limiting;
mod worker;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::RateLimitingQueue;
pub use worker::{spawn_workers, DroppedKey, Reconcile, Worker, DEFAULT_MAX_RETRIES};
