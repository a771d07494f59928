use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::{BucketSpec, BucketTake, CounterStore, CounterStoreError};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

// Lua numbers cross the script boundary as integers, which would truncate fractional token
// counts. Token and timestamp values are therefore returned as strings and parsed here.
const TAKE_TOKEN_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call("HMGET", KEYS[1], "tokens", "ts")
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

if tokens > capacity then
  tokens = capacity
end
if tokens < 0 then
  tokens = 0
end

if now > ts then
  tokens = math.min(capacity, tokens + ((now - ts) / 1000) * rate)
  ts = now
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call("HSET", KEYS[1], "tokens", tostring(tokens), "ts", tostring(ts))
redis.call("EXPIRE", KEYS[1], ttl)
return {allowed, tostring(tokens)}
"#;

/// Counter store backed by Redis. Bucket updates run as one Lua script so concurrent
/// gateway instances observe a single serialized read-modify-write.
///
/// One multiplexed connection is opened on first use and shared by every clone; the
/// manager reconnects on its own after the server drops it.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    manager: Arc<OnceCell<ConnectionManager>>,
    prefix: String,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .field("operation_timeout", &self.operation_timeout)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CounterStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            manager: Arc::new(OnceCell::new()),
            prefix: "ditto".to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.operation_timeout = timeout;
        }
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.manager.initialized()
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CounterStoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CounterStoreError::Timeout(self.operation_timeout)),
        }
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        let key = self.key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let value: Option<i64> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        let key = self.key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: () = conn.set_ex(key, value, ttl_seconds(ttl) as u64).await?;
            Ok(())
        })
        .await
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CounterStoreError> {
        let key = self.key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            pipe.atomic().incr(&key, delta);
            if let Some(ttl) = ttl {
                pipe.expire(&key, ttl_seconds(ttl)).ignore();
            }
            let (value,): (i64,) = pipe.query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CounterStoreError> {
        let key = self.key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: () = conn.del(key).await?;
            Ok(())
        })
        .await
    }

    async fn take_token(
        &self,
        key: &str,
        spec: BucketSpec,
        now_epoch_millis: u64,
    ) -> Result<BucketTake, CounterStoreError> {
        let key = self.key(key);
        let (allowed, tokens): (i64, String) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                redis::Script::new(TAKE_TOKEN_SCRIPT)
                    .key(&key)
                    .arg(spec.capacity)
                    .arg(spec.refill_per_second)
                    .arg(now_epoch_millis)
                    .arg(ttl_seconds(spec.ttl))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        let tokens_remaining = tokens
            .trim()
            .parse::<f64>()
            .map_err(|_| CounterStoreError::Corrupt(format!("bucket tokens {tokens:?}")))?;
        Ok(BucketTake {
            allowed: allowed == 1,
            tokens_remaining,
        })
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn redis_url() -> Option<String> {
        env_nonempty("DITTO_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
    }

    static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn test_prefix() -> String {
        let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("ditto_test:{millis}:{n}")
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_seconds(Duration::from_millis(0)), 1);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_seconds(Duration::from_secs(3)), 3);
        assert_eq!(ttl_seconds(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn redis_bucket_keeps_fractional_tokens() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = RedisCounterStore::new(url)
            .expect("store")
            .with_prefix(test_prefix());
        store.ping().await.expect("ping");

        let spec = BucketSpec {
            capacity: 2.0,
            refill_per_second: 100.0,
            ttl: Duration::from_secs(2),
        };
        let now = 1_700_000_000_000u64;
        assert!(store.take_token("b", spec, now).await.expect("take").allowed);
        assert!(store.take_token("b", spec, now).await.expect("take").allowed);
        let denied = store.take_token("b", spec, now + 5).await.expect("take");
        assert!(!denied.allowed);
        assert!((denied.tokens_remaining - 0.5).abs() < 1e-6);

        store.delete("b").await.expect("reset");
        let fresh = store.take_token("b", spec, now + 6).await.expect("take");
        assert!(fresh.allowed);
        assert!((fresh.tokens_remaining - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn clones_share_one_lazily_opened_connection() {
        let offline = RedisCounterStore::new("redis://127.0.0.1:1").expect("store");
        assert!(!offline.is_connected());

        let Some(url) = redis_url() else {
            return;
        };
        let store = RedisCounterStore::new(url)
            .expect("store")
            .with_prefix(test_prefix());
        let clone = store.clone();
        assert!(!clone.is_connected());
        store.ping().await.expect("ping");
        assert!(clone.is_connected());
        for _ in 0..10 {
            clone.increment("shared", 1, None).await.expect("incr");
        }
        assert_eq!(store.get("shared").await.expect("get"), Some(10));
        store.delete("shared").await.expect("cleanup");
    }

    #[tokio::test]
    async fn redis_counters_increment_and_expire() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = RedisCounterStore::new(url)
            .expect("store")
            .with_prefix(test_prefix());

        assert_eq!(store.get("c").await.expect("get"), None);
        let value = store
            .increment("c", 3, Some(Duration::from_secs(30)))
            .await
            .expect("incr");
        assert_eq!(value, 3);
        store
            .set_with_expiry("c", 10, Duration::from_secs(30))
            .await
            .expect("set");
        assert_eq!(store.get("c").await.expect("get"), Some(10));
    }
}
