use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::gateway::Clock;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Suspect,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Consecutive live-traffic failures that turn a healthy backend suspect.
    #[serde(default = "default_suspect_after_failures")]
    pub suspect_after_failures: u32,
    /// Consecutive failures while suspect that make it unhealthy.
    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,
    /// Consecutive successful probes needed to return to healthy.
    #[serde(default = "default_healthy_after_successes")]
    pub healthy_after_successes: u32,
    /// How long a suspect backend's canary slot stays taken without a report.
    #[serde(default = "default_canary_lease_seconds")]
    pub canary_lease_seconds: u64,
}

fn default_suspect_after_failures() -> u32 {
    3
}

fn default_unhealthy_after_failures() -> u32 {
    2
}

fn default_healthy_after_successes() -> u32 {
    2
}

fn default_canary_lease_seconds() -> u64 {
    30
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            suspect_after_failures: default_suspect_after_failures(),
            unhealthy_after_failures: default_unhealthy_after_failures(),
            healthy_after_successes: default_healthy_after_successes(),
            canary_lease_seconds: default_canary_lease_seconds(),
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.suspect_after_failures == 0
            || self.unhealthy_after_failures == 0
            || self.healthy_after_successes == 0
        {
            return Err("health thresholds must be >= 1".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    TrafficSuccess,
    TrafficFailure,
    ProbeSuccess,
    ProbeFailure,
}

impl Observation {
    fn is_success(self) -> bool {
        matches!(self, Observation::TrafficSuccess | Observation::ProbeSuccess)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendHealthSnapshot {
    pub backend: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ts_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_ts_ms: Option<u64>,
    pub last_transition_ts_ms: u64,
}

#[derive(Clone, Debug, Default)]
struct BackendHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    canary_taken_at_ms: Option<u64>,
    last_error: Option<String>,
    last_failure_ts_ms: Option<u64>,
    last_probe_ts_ms: Option<u64>,
    last_transition_ts_ms: u64,
}

impl BackendHealth {
    fn transition(&mut self, to: HealthStatus, now_ms: u64) {
        self.status = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.canary_taken_at_ms = None;
        self.last_transition_ts_ms = now_ms;
    }

    fn observe(
        &mut self,
        observation: Observation,
        message: Option<String>,
        thresholds: &HealthThresholds,
        now_ms: u64,
    ) {
        if matches!(
            observation,
            Observation::ProbeSuccess | Observation::ProbeFailure
        ) {
            self.last_probe_ts_ms = Some(now_ms);
        }
        self.canary_taken_at_ms = None;

        if observation.is_success() {
            self.consecutive_failures = 0;
            if self.status == HealthStatus::Healthy {
                return;
            }
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.consecutive_successes >= thresholds.healthy_after_successes {
                self.transition(HealthStatus::Healthy, now_ms);
                self.last_error = None;
            }
            return;
        }

        self.last_error = message;
        self.last_failure_ts_ms = Some(now_ms);
        self.consecutive_successes = 0;
        match self.status {
            HealthStatus::Healthy => {
                if observation == Observation::ProbeFailure {
                    self.transition(HealthStatus::Suspect, now_ms);
                    return;
                }
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= thresholds.suspect_after_failures {
                    self.transition(HealthStatus::Suspect, now_ms);
                }
            }
            HealthStatus::Suspect => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= thresholds.unhealthy_after_failures {
                    self.transition(HealthStatus::Unhealthy, now_ms);
                }
            }
            HealthStatus::Unhealthy => {}
        }
    }

    fn snapshot(&self, backend: &str) -> BackendHealthSnapshot {
        BackendHealthSnapshot {
            backend: backend.to_string(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_error: self.last_error.clone(),
            last_failure_ts_ms: self.last_failure_ts_ms,
            last_probe_ts_ms: self.last_probe_ts_ms,
            last_transition_ts_ms: self.last_transition_ts_ms,
        }
    }
}

/// Health state per backend. Writers serialize on a short mutex and publish a fresh
/// status map; readers only load the published map and never block.
pub struct HealthTable {
    thresholds: HealthThresholds,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, BackendHealth>>,
    published: ArcSwap<HashMap<String, HealthStatus>>,
}

impl HealthTable {
    pub fn new(thresholds: HealthThresholds, clock: Arc<dyn Clock>) -> Self {
        Self {
            thresholds,
            clock,
            states: Mutex::new(HashMap::new()),
            published: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Backends never observed are treated as healthy.
    pub fn status(&self, backend: &str) -> HealthStatus {
        self.published
            .load()
            .get(backend)
            .copied()
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Arc<HashMap<String, HealthStatus>> {
        self.published.load_full()
    }

    fn with_states<R>(&self, f: impl FnOnce(&mut HashMap<String, BackendHealth>, u64) -> R) -> R {
        let now = self.clock.now_epoch_millis();
        let mut states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        let out = f(&mut states, now);
        let view: HashMap<String, HealthStatus> = states
            .iter()
            .map(|(id, state)| (id.clone(), state.status))
            .collect();
        self.published.store(Arc::new(view));
        out
    }

    /// Aligns the table with the backends of a new policy snapshot.
    pub fn sync_backends(&self, ids: &[String]) {
        self.with_states(|states, now| {
            states.retain(|id, _| ids.contains(id));
            for id in ids {
                states.entry(id.clone()).or_insert_with(|| BackendHealth {
                    last_transition_ts_ms: now,
                    ..BackendHealth::default()
                });
            }
        });
    }

    pub fn observe(&self, backend: &str, observation: Observation, message: Option<String>) {
        let thresholds = self.thresholds.clone();
        let (before, after) = self.with_states(|states, now| {
            let state = states.entry(backend.to_string()).or_default();
            let before = state.status;
            state.observe(observation, message, &thresholds, now);
            (before, state.status)
        });
        if before != after {
            tracing::warn!(backend, from = ?before, to = ?after, "backend health changed");
        }
    }

    /// Claims the single canary slot of a suspect backend.
    pub fn try_acquire_canary(&self, backend: &str) -> bool {
        let lease = Duration::from_secs(self.thresholds.canary_lease_seconds).as_millis() as u64;
        self.with_states(|states, now| {
            let Some(state) = states.get_mut(backend) else {
                return false;
            };
            if state.status != HealthStatus::Suspect {
                return false;
            }
            match state.canary_taken_at_ms {
                Some(taken) if now.saturating_sub(taken) < lease => false,
                _ => {
                    state.canary_taken_at_ms = Some(now);
                    true
                }
            }
        })
    }

    pub fn force(&self, backend: &str, status: HealthStatus) -> bool {
        self.with_states(|states, now| {
            let Some(state) = states.get_mut(backend) else {
                return false;
            };
            state.transition(status, now);
            if status == HealthStatus::Healthy {
                state.last_error = None;
            }
            true
        })
    }

    pub fn snapshot(&self) -> Vec<BackendHealthSnapshot> {
        let states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<BackendHealthSnapshot> = states
            .iter()
            .map(|(id, state)| state.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.backend.cmp(&b.backend));
        out
    }

    pub fn backend_snapshot(&self, backend: &str) -> Option<BackendHealthSnapshot> {
        let states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.get(backend).map(|state| state.snapshot(backend))
    }
}
