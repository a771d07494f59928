use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BucketSpec, BucketTake, CounterStore, CounterStoreError, refill_and_take};
use crate::gateway::{Clock, SystemClock};

#[derive(Clone, Copy, Debug)]
enum Slot {
    Counter(i64),
    Bucket { tokens: f64, last_refill_millis: u64 },
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    slot: Slot,
    expires_at_millis: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_millis: u64) -> bool {
        self.expires_at_millis
            .map(|expires| now_millis < expires)
            .unwrap_or(true)
    }
}

/// Process-local counter store. Every operation runs under one short mutex, which makes
/// each take or increment atomic with respect to concurrent tasks in this process.
#[derive(Clone)]
pub struct MemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore").finish_non_exhaustive()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn expiry(&self, now_millis: u64, ttl: Duration) -> Option<u64> {
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Some(now_millis.saturating_add(ttl_millis))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, CounterStoreError> {
        self.entries
            .lock()
            .map_err(|_| CounterStoreError::Corrupt("memory store lock poisoned".to_string()))
    }

    /// Drops expired entries; called opportunistically on writes.
    fn sweep(entries: &mut HashMap<String, Entry>, now_millis: u64) {
        if entries.len() < 4096 {
            return;
        }
        entries.retain(|_, entry| entry.is_live(now_millis));
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        let now = self.clock.now_epoch_millis();
        let entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.slot {
                Slot::Counter(value) => Ok(Some(value)),
                Slot::Bucket { .. } => Err(CounterStoreError::Corrupt(format!(
                    "{key} holds a bucket, not a counter"
                ))),
            },
            _ => Ok(None),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        let now = self.clock.now_epoch_millis();
        let mut entries = self.lock()?;
        Self::sweep(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Counter(value),
                expires_at_millis: self.expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CounterStoreError> {
        let now = self.clock.now_epoch_millis();
        let mut entries = self.lock()?;
        Self::sweep(&mut entries, now);

        let (current, expires) = match entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.slot {
                Slot::Counter(value) => (value, entry.expires_at_millis),
                Slot::Bucket { .. } => {
                    return Err(CounterStoreError::Corrupt(format!(
                        "{key} holds a bucket, not a counter"
                    )));
                }
            },
            _ => (0, None),
        };
        let next = current.saturating_add(delta);
        let expires_at_millis = match ttl {
            Some(ttl) => self.expiry(now, ttl),
            None => expires,
        };
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Counter(next),
                expires_at_millis,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn take_token(
        &self,
        key: &str,
        spec: BucketSpec,
        now_epoch_millis: u64,
    ) -> Result<BucketTake, CounterStoreError> {
        let mut entries = self.lock()?;
        Self::sweep(&mut entries, now_epoch_millis);

        let (tokens, last_refill_millis) = match entries.get(key) {
            Some(entry) if entry.is_live(now_epoch_millis) => match entry.slot {
                Slot::Bucket {
                    tokens,
                    last_refill_millis,
                } => (tokens, last_refill_millis),
                Slot::Counter(_) => {
                    return Err(CounterStoreError::Corrupt(format!(
                        "{key} holds a counter, not a bucket"
                    )));
                }
            },
            _ => (spec.capacity, now_epoch_millis),
        };

        let (allowed, tokens, last_refill_millis) =
            refill_and_take(tokens, last_refill_millis, spec, now_epoch_millis);
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Bucket {
                    tokens,
                    last_refill_millis,
                },
                expires_at_millis: self.expiry(now_epoch_millis, spec.ttl),
            },
        );

        Ok(BucketTake {
            allowed,
            tokens_remaining: tokens,
        })
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;

    fn bucket() -> BucketSpec {
        BucketSpec {
            capacity: 2.0,
            refill_per_second: 1.0,
            ttl: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn counters_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = MemoryCounterStore::with_clock(clock.clone());

        store
            .increment("budget:t1", 5, Some(Duration::from_secs(10)))
            .await
            .expect("incr");
        assert_eq!(store.get("budget:t1").await.expect("get"), Some(5));

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.get("budget:t1").await.expect("get"), None);
        assert_eq!(
            store.increment("budget:t1", 1, None).await.expect("incr"),
            1
        );
    }

    #[tokio::test]
    async fn increment_without_ttl_keeps_existing_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCounterStore::with_clock(clock.clone());
        store
            .set_with_expiry("k", 1, Duration::from_secs(5))
            .await
            .expect("set");
        store.increment("k", 1, None).await.expect("incr");
        clock.advance(Duration::from_secs(6));
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn missing_bucket_starts_full_and_idle_bucket_expires() {
        let store = MemoryCounterStore::with_clock(Arc::new(ManualClock::new(0)));
        let first = store.take_token("b", bucket(), 1_000).await.expect("take");
        assert!(first.allowed);
        assert_eq!(first.tokens_remaining, 1.0);

        let second = store.take_token("b", bucket(), 1_000).await.expect("take");
        assert!(second.allowed);
        let third = store.take_token("b", bucket(), 1_000).await.expect("take");
        assert!(!third.allowed);

        // Past the ttl the entry is gone and the bucket is rebuilt at capacity.
        let rebuilt = store.take_token("b", bucket(), 10_000).await.expect("take");
        assert!(rebuilt.allowed);
        assert_eq!(rebuilt.tokens_remaining, 1.0);
    }

    #[tokio::test]
    async fn concurrent_takes_never_exceed_capacity() {
        let store = MemoryCounterStore::with_clock(Arc::new(ManualClock::new(0)));
        let spec = BucketSpec {
            capacity: 50.0,
            refill_per_second: 0.001,
            ttl: Duration::from_secs(60),
        };

        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.take_token("shared", spec, 5).await.expect("take").allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn mixing_counter_and_bucket_keys_is_reported() {
        let store = MemoryCounterStore::with_clock(Arc::new(ManualClock::new(0)));
        store.increment("k", 1, None).await.expect("incr");
        let err = store.take_token("k", bucket(), 0).await.unwrap_err();
        assert!(matches!(err, CounterStoreError::Corrupt(_)));
    }
}
