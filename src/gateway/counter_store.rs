//! Shared counter store: the only place cross-instance mutable state lives.
//!
//! Rate-limit buckets and budget ledgers are mutated exclusively through the atomic
//! operations on [`CounterStore`]. The in-memory implementation serves tests and single
//! instance deployments; the Redis implementation serves fleets.

mod memory;
#[cfg(feature = "store-redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryCounterStore;
#[cfg(feature = "store-redis")]
pub use redis_store::RedisCounterStore;

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected value in counter store: {0}")]
    Corrupt(String),
}

/// Parameters of one token bucket, passed on every take so the store stays stateless
/// about profiles.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub ttl: Duration,
}

/// Bucket state observed right after an atomic take.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketTake {
    pub allowed: bool,
    pub tokens_remaining: f64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CounterStoreError>;

    /// Atomically adds `delta` and returns the new value. A `ttl` is applied when given.
    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CounterStoreError>;

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError>;

    /// Refills the bucket at `key` for the time elapsed since its last refill and tries to
    /// deduct one token, as a single atomic step. A missing bucket starts full.
    async fn take_token(
        &self,
        key: &str,
        spec: BucketSpec,
        now_epoch_millis: u64,
    ) -> Result<BucketTake, CounterStoreError>;

    async fn ping(&self) -> Result<(), CounterStoreError>;
}

/// Token bucket arithmetic shared by every store. Returns `(allowed, tokens, refill_ts)`.
pub(crate) fn refill_and_take(
    tokens: f64,
    last_refill_millis: u64,
    spec: BucketSpec,
    now_epoch_millis: u64,
) -> (bool, f64, u64) {
    let mut tokens = tokens.clamp(0.0, spec.capacity);
    let mut last = last_refill_millis;
    // Another instance may run with a clock slightly ahead; never refill backwards.
    if now_epoch_millis > last {
        let elapsed_seconds = (now_epoch_millis - last) as f64 / 1000.0;
        tokens = (tokens + elapsed_seconds * spec.refill_per_second).min(spec.capacity);
        last = now_epoch_millis;
    }
    if tokens >= 1.0 {
        (true, tokens - 1.0, last)
    } else {
        (false, tokens, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BucketSpec {
        BucketSpec {
            capacity: 200.0,
            refill_per_second: 100.0,
            ttl: Duration::from_secs(3),
        }
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (allowed, tokens, ts) = refill_and_take(150.0, 0, spec(), 60_000);
        assert!(allowed);
        assert_eq!(tokens, 199.0);
        assert_eq!(ts, 60_000);
    }

    #[test]
    fn refill_uses_sub_second_elapsed_time() {
        let (allowed, tokens, _) = refill_and_take(0.0, 1_000, spec(), 1_005);
        assert!(!allowed);
        assert!((tokens - 0.5).abs() < 1e-9);

        let (allowed, tokens, _) = refill_and_take(tokens, 1_005, spec(), 1_011);
        assert!(allowed);
        assert!((tokens - 0.1).abs() < 1e-6);
    }

    #[test]
    fn clock_skew_never_refills_backwards() {
        let (allowed, tokens, ts) = refill_and_take(0.2, 5_000, spec(), 4_000);
        assert!(!allowed);
        assert_eq!(tokens, 0.2);
        assert_eq!(ts, 5_000);
    }
}
