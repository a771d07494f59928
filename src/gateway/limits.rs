use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Clock;
use super::counter_store::{BucketSpec, CounterStore, CounterStoreError};

/// Upper bound on how long an idle bucket is kept in the counter store.
const MAX_BUCKET_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Sustained rate and burst capacity of one tenant's bucket.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitProfile {
    /// Tokens refilled per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitProfile {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 200,
        }
    }
}

impl RateLimitProfile {
    pub fn validate(&self) -> Result<(), String> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(format!("rate must be > 0, got {}", self.rate));
        }
        if self.burst == 0 {
            return Err("burst must be >= 1".to_string());
        }
        Ok(())
    }

    /// Time for an empty bucket to fill back up to capacity. Saturates for tiny rates.
    pub fn refill_period(&self) -> Duration {
        saturating_secs(f64::from(self.burst) / self.rate)
    }

    /// Time for a single token to accrue.
    pub fn refill_tick(&self) -> Duration {
        saturating_secs(1.0 / self.rate)
    }

    fn bucket_spec(&self) -> BucketSpec {
        BucketSpec {
            capacity: f64::from(self.burst),
            refill_per_second: self.rate,
            // Idle buckets vanish a little after they would have refilled completely.
            ttl: self
                .refill_period()
                .saturating_add(Duration::from_secs(1))
                .min(MAX_BUCKET_TTL),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub default: RateLimitProfile,
    #[serde(default)]
    pub tenants: HashMap<String, RateLimitProfile>,
    /// Admit requests when the counter store cannot be reached.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_fail_open() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateStatus {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateDecision {
    Allow(RateStatus),
    Deny {
        status: RateStatus,
        /// Always strictly positive.
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn status(&self) -> RateStatus {
        match self {
            RateDecision::Allow(status) | RateDecision::Deny { status, .. } => *status,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow(_))
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    Store(#[from] CounterStoreError),
}

/// Per-tenant token bucket admission control over a shared [`CounterStore`].
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitsConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitsConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn profile_for(&self, tenant_id: &str) -> RateLimitProfile {
        self.config
            .tenants
            .get(tenant_id)
            .copied()
            .unwrap_or(self.config.default)
    }

    fn bucket_key(tenant_id: &str) -> String {
        format!("rate_limit:tenant:{tenant_id}")
    }

    pub async fn admit(&self, tenant_id: &str) -> Result<RateDecision, RateLimitError> {
        let profile = self.profile_for(tenant_id);
        let now = self.clock.now_epoch_millis();

        let take = match self
            .store
            .take_token(&Self::bucket_key(tenant_id), profile.bucket_spec(), now)
            .await
        {
            Ok(take) => take,
            Err(err) if self.config.fail_open => {
                tracing::warn!(tenant = tenant_id, error = %err, "rate limit store unavailable, admitting");
                return Ok(RateDecision::Allow(RateStatus {
                    limit: profile.burst,
                    remaining: profile.burst,
                    reset_after: Duration::ZERO,
                }));
            }
            Err(err) => return Err(err.into()),
        };

        let capacity = f64::from(profile.burst);
        let tokens = take.tokens_remaining.clamp(0.0, capacity);
        let status = RateStatus {
            limit: profile.burst,
            remaining: tokens.floor() as u32,
            reset_after: seconds_to_duration((capacity - tokens) / profile.rate),
        };

        if take.allowed {
            return Ok(RateDecision::Allow(status));
        }

        let retry_after = retry_after(tokens, &profile);
        tracing::debug!(
            tenant = tenant_id,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate limit exceeded"
        );
        Ok(RateDecision::Deny {
            status,
            retry_after,
        })
    }

    /// Restores the tenant's bucket to full capacity. Safe to repeat.
    pub async fn reset(&self, tenant_id: &str) -> Result<(), RateLimitError> {
        self.store.delete(&Self::bucket_key(tenant_id)).await?;
        tracing::info!(tenant = tenant_id, "rate limit bucket reset");
        Ok(())
    }
}

/// Time until one whole token is available, clamped to at least one refill tick.
fn retry_after(tokens: f64, profile: &RateLimitProfile) -> Duration {
    let tick = profile.refill_tick().max(Duration::from_millis(1));
    let missing = 1.0 - tokens;
    let seconds = missing / profile.rate;
    if !seconds.is_finite() || seconds <= 0.0 {
        return tick;
    }
    let computed = seconds_to_duration(seconds);
    if computed.is_zero() { tick } else { computed }
}

fn saturating_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    // Whole milliseconds, rounded up so a client waiting exactly this long finds a token.
    Duration::from_millis((seconds * 1000.0).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::counter_store::MemoryCounterStore;

    fn limiter(config: RateLimitsConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        (RateLimiter::new(store, clock.clone(), config), clock)
    }

    async fn drain(limiter: &RateLimiter, tenant: &str, n: u32) {
        for i in 0..n {
            let decision = limiter.admit(tenant).await.expect("admit");
            assert!(decision.is_allowed(), "request {i} should be admitted");
        }
    }

    #[tokio::test]
    async fn default_profile_is_rate_100_burst_200() {
        let (limiter, _clock) = limiter(RateLimitsConfig::default());
        assert_eq!(limiter.profile_for("any"), RateLimitProfile::default());

        drain(&limiter, "t1", 200).await;
        let decision = limiter.admit("t1").await.expect("admit");
        let RateDecision::Deny {
            status,
            retry_after,
        } = decision
        else {
            panic!("201st request must be denied");
        };
        assert_eq!(status.limit, 200);
        assert_eq!(status.remaining, 0);
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= RateLimitProfile::default().refill_period());
    }

    #[tokio::test]
    async fn exhausted_tenant_does_not_affect_other_tenants() {
        let (limiter, _clock) = limiter(RateLimitsConfig::default());
        drain(&limiter, "tenant-a", 200).await;
        assert!(!limiter.admit("tenant-a").await.expect("admit").is_allowed());

        for _ in 0..200 {
            assert!(limiter.admit("tenant-b").await.expect("admit").is_allowed());
        }
    }

    #[tokio::test]
    async fn refill_is_sub_second_and_capped() {
        let (limiter, clock) = limiter(RateLimitsConfig::default());
        drain(&limiter, "t1", 200).await;

        clock.advance(Duration::from_millis(5));
        let decision = limiter.admit("t1").await.expect("admit");
        let RateDecision::Deny { retry_after, .. } = decision else {
            panic!("half a token is not enough");
        };
        assert!(retry_after >= Duration::from_millis(5));
        assert!(retry_after <= Duration::from_millis(6));

        clock.advance(Duration::from_secs(1));
        drain(&limiter, "t1", 100).await;

        clock.advance(Duration::from_secs(60));
        let decision = limiter.admit("t1").await.expect("admit");
        assert_eq!(decision.status().remaining, 199);
    }

    #[tokio::test]
    async fn a_full_refill_tick_after_drain_admits_exactly_one_request() {
        let (limiter, clock) = limiter(RateLimitsConfig::default());
        drain(&limiter, "early", 200).await;
        drain(&limiter, "on-time", 200).await;

        clock.advance(Duration::from_millis(9));
        assert!(!limiter.admit("early").await.expect("admit").is_allowed());

        // 10 ms at 100 tokens/s accrues one whole token, which a take may spend.
        clock.advance(Duration::from_millis(1));
        let decision = limiter.admit("on-time").await.expect("admit");
        assert!(decision.is_allowed());
        assert_eq!(decision.status().remaining, 0);
        assert!(!limiter.admit("on-time").await.expect("admit").is_allowed());
    }

    #[tokio::test]
    async fn remaining_never_exceeds_capacity() {
        let (limiter, clock) = limiter(RateLimitsConfig::default());
        for _ in 0..50 {
            let status = limiter.admit("t1").await.expect("admit").status();
            assert!(status.remaining <= status.limit);
            clock.advance(Duration::from_millis(700));
        }
    }

    #[tokio::test]
    async fn retry_after_is_clamped_to_a_refill_tick() {
        let profile = RateLimitProfile {
            rate: 100.0,
            burst: 1,
        };
        assert_eq!(retry_after(1.0, &profile), Duration::from_millis(10));
        assert_eq!(retry_after(1.5, &profile), Duration::from_millis(10));
        assert_eq!(retry_after(0.0, &profile), Duration::from_millis(10));
        assert_eq!(retry_after(0.999_999_9, &profile), Duration::from_millis(1));

        let slow = RateLimitProfile {
            rate: 0.5,
            burst: 1,
        };
        assert_eq!(retry_after(0.0, &slow), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn vanishing_rates_saturate_instead_of_overflowing() {
        let profile = RateLimitProfile {
            rate: 1e-20,
            burst: 200,
        };
        profile.validate().expect("positive finite rate");
        assert_eq!(profile.refill_period(), Duration::MAX);
        assert_eq!(profile.refill_tick(), Duration::MAX);
        assert_eq!(profile.bucket_spec().ttl, MAX_BUCKET_TTL);

        let mut config = RateLimitsConfig::default();
        config.tenants.insert("glacial".to_string(), profile);
        let (limiter, _clock) = limiter(config);
        drain(&limiter, "glacial", 200).await;
        let RateDecision::Deny { retry_after, status } =
            limiter.admit("glacial").await.expect("admit")
        else {
            panic!("bucket is empty");
        };
        assert!(retry_after >= Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn tenant_override_replaces_default_profile() {
        let mut config = RateLimitsConfig::default();
        config.tenants.insert(
            "small".to_string(),
            RateLimitProfile {
                rate: 1.0,
                burst: 2,
            },
        );
        let (limiter, _clock) = limiter(config);
        drain(&limiter, "small", 2).await;
        let RateDecision::Deny { retry_after, .. } = limiter.admit("small").await.expect("admit")
        else {
            panic!("override burst is 2");
        };
        assert_eq!(retry_after, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_never_overfills() {
        let (limiter, _clock) = limiter(RateLimitsConfig::default());
        drain(&limiter, "t1", 200).await;

        limiter.reset("t1").await.expect("reset");
        limiter.reset("t1").await.expect("reset");

        drain(&limiter, "t1", 200).await;
        assert!(!limiter.admit("t1").await.expect("admit").is_allowed());
    }

    #[test]
    fn invalid_profiles_are_rejected() {
        assert!(RateLimitProfile { rate: 0.0, burst: 1 }.validate().is_err());
        assert!(RateLimitProfile { rate: 1.0, burst: 0 }.validate().is_err());
        assert!(RateLimitProfile::default().validate().is_ok());
    }
}
