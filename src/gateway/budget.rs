//! Per-tenant spend admission.
//!
//! Admission compares the last recorded `consumed` value with the limit; consumption is
//! advanced afterwards from usage, so a burst of concurrent requests may overshoot by up to
//! one accounting cycle. Availability wins over exactness here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, Month, OffsetDateTime};

use super::Clock;
use super::counter_store::{CounterStore, CounterStoreError};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    #[default]
    Total,
    Daily,
    Monthly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Tokens,
    Requests,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetProfile {
    pub limit: u64,
    #[serde(default)]
    pub period: BudgetPeriod,
    #[serde(default)]
    pub unit: BudgetUnit,
}

impl BudgetProfile {
    /// Cost of one completed request once its usage is known.
    pub fn realized_cost(&self, input_units: u64, output_units: u64) -> u64 {
        match self.unit {
            BudgetUnit::Tokens => input_units.saturating_add(output_units),
            BudgetUnit::Requests => 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BudgetsConfig {
    #[serde(default)]
    pub default: Option<BudgetProfile>,
    #[serde(default)]
    pub tenants: HashMap<String, BudgetProfile>,
    /// Conservative per-request cost used at admission time.
    #[serde(default = "default_estimated_cost")]
    pub estimated_cost: u64,
    #[serde(default = "default_denial_status")]
    pub denial_status: u16,
    /// Record usage synchronously before the response is returned.
    #[serde(default)]
    pub recheck_after_dispatch: bool,
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_estimated_cost() -> u64 {
    1
}

fn default_denial_status() -> u16 {
    402
}

fn default_fail_open() -> bool {
    true
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        Self {
            default: None,
            tenants: HashMap::new(),
            estimated_cost: default_estimated_cost(),
            denial_status: default_denial_status(),
            recheck_after_dispatch: false,
            fail_open: default_fail_open(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow {
        limit: Option<u64>,
        consumed: u64,
    },
    Deny {
        limit: u64,
        consumed: u64,
        attempted: u64,
    },
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget ledger unavailable: {0}")]
    Store(#[from] CounterStoreError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetLedger {
    pub tenant_id: String,
    pub period_start_epoch_seconds: u64,
    pub limit: u64,
    pub consumed: u64,
}

pub struct BudgetEnforcer {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: BudgetsConfig,
}

impl BudgetEnforcer {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, config: BudgetsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BudgetsConfig {
        &self.config
    }

    pub fn profile_for(&self, tenant_id: &str) -> Option<BudgetProfile> {
        self.config
            .tenants
            .get(tenant_id)
            .copied()
            .or(self.config.default)
    }

    /// Time until the tenant's current budget period ends.
    pub fn resets_after(&self, tenant_id: &str) -> Option<Duration> {
        let profile = self.profile_for(tenant_id)?;
        let now = self.clock.now_epoch_seconds();
        let end = period_end(profile.period, now)?;
        Some(Duration::from_secs(end.saturating_sub(now)))
    }

    pub fn estimated_cost(&self) -> u64 {
        self.config.estimated_cost
    }

    fn ledger_key(&self, tenant_id: &str, profile: &BudgetProfile) -> (String, u64, Option<Duration>) {
        let now = self.clock.now_epoch_seconds();
        let start = period_start(profile.period, now);
        let ttl = match profile.period {
            BudgetPeriod::Total => None,
            BudgetPeriod::Daily => Some(Duration::from_secs(2 * SECONDS_PER_DAY)),
            BudgetPeriod::Monthly => Some(Duration::from_secs(32 * SECONDS_PER_DAY)),
        };
        (format!("budget:{tenant_id}:{start}"), start, ttl)
    }

    pub async fn check(
        &self,
        tenant_id: &str,
        estimated_cost: u64,
    ) -> Result<BudgetDecision, BudgetError> {
        let Some(profile) = self.profile_for(tenant_id) else {
            return Ok(BudgetDecision::Allow {
                limit: None,
                consumed: 0,
            });
        };

        let (key, _, _) = self.ledger_key(tenant_id, &profile);
        let consumed = match self.store.get(&key).await {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(err) if self.config.fail_open => {
                tracing::warn!(tenant = tenant_id, error = %err, "budget ledger unavailable, admitting");
                return Ok(BudgetDecision::Allow {
                    limit: Some(profile.limit),
                    consumed: 0,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if consumed.saturating_add(estimated_cost) > profile.limit {
            return Ok(BudgetDecision::Deny {
                limit: profile.limit,
                consumed,
                attempted: estimated_cost,
            });
        }
        Ok(BudgetDecision::Allow {
            limit: Some(profile.limit),
            consumed,
        })
    }

    /// Advances the tenant's ledger by realized usage. Returns the new consumed total, or
    /// `None` when the tenant has no budget.
    pub async fn record(
        &self,
        tenant_id: &str,
        input_units: u64,
        output_units: u64,
    ) -> Result<Option<u64>, BudgetError> {
        let Some(profile) = self.profile_for(tenant_id) else {
            return Ok(None);
        };
        let cost = profile.realized_cost(input_units, output_units);
        let (key, _, ttl) = self.ledger_key(tenant_id, &profile);
        let delta = i64::try_from(cost).unwrap_or(i64::MAX);
        let consumed = self.store.increment(&key, delta, ttl).await?;
        Ok(Some(consumed.max(0) as u64))
    }

    pub async fn ledger(&self, tenant_id: &str) -> Result<Option<BudgetLedger>, BudgetError> {
        let Some(profile) = self.profile_for(tenant_id) else {
            return Ok(None);
        };
        let (key, start, _) = self.ledger_key(tenant_id, &profile);
        let consumed = self.store.get(&key).await?.unwrap_or(0).max(0) as u64;
        Ok(Some(BudgetLedger {
            tenant_id: tenant_id.to_string(),
            period_start_epoch_seconds: start,
            limit: profile.limit,
            consumed,
        }))
    }
}

/// Start of the period following the one containing `now_epoch_seconds`.
pub fn period_end(period: BudgetPeriod, now_epoch_seconds: u64) -> Option<u64> {
    match period {
        BudgetPeriod::Total => None,
        BudgetPeriod::Daily => Some(period_start(period, now_epoch_seconds) + SECONDS_PER_DAY),
        BudgetPeriod::Monthly => {
            let first = first_of_month(now_epoch_seconds)?;
            let (year, month) = match first.month() {
                Month::December => (first.year() + 1, Month::January),
                month => (first.year(), month.next()),
            };
            let next = Date::from_calendar_date(year, month, 1).ok()?;
            Some(midnight_epoch_seconds(next))
        }
    }
}

pub fn period_start(period: BudgetPeriod, now_epoch_seconds: u64) -> u64 {
    let day_start = now_epoch_seconds - now_epoch_seconds % SECONDS_PER_DAY;
    match period {
        BudgetPeriod::Total => 0,
        BudgetPeriod::Daily => day_start,
        BudgetPeriod::Monthly => first_of_month(now_epoch_seconds)
            .map(midnight_epoch_seconds)
            .unwrap_or(day_start),
    }
}

/// UTC calendar date of the first day of the month containing `now_epoch_seconds`.
fn first_of_month(now_epoch_seconds: u64) -> Option<Date> {
    let seconds = i64::try_from(now_epoch_seconds).ok()?;
    let now = OffsetDateTime::from_unix_timestamp(seconds).ok()?;
    now.date().replace_day(1).ok()
}

fn midnight_epoch_seconds(date: Date) -> u64 {
    u64::try_from(date.midnight().assume_utc().unix_timestamp()).unwrap_or(0)
}
