use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::pipeline::Stage;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub completed: u64,
    pub invalid_requests: u64,
    pub auth_failed: u64,
    pub rate_limited: u64,
    pub budget_exceeded: u64,
    pub routing_failed: u64,
    pub backend_calls: u64,
    pub failovers: u64,
    pub dispatch_failed: u64,
    pub deadline_exceeded: u64,
    pub cancelled: u64,
}

/// Process-local request counters, updated lock-free from every request task.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    completed: AtomicU64,
    invalid_requests: AtomicU64,
    auth_failed: AtomicU64,
    rate_limited: AtomicU64,
    budget_exceeded: AtomicU64,
    routing_failed: AtomicU64,
    backend_calls: AtomicU64,
    failovers: AtomicU64,
    dispatch_failed: AtomicU64,
    deadline_exceeded: AtomicU64,
    cancelled: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    pub fn record_backend_calls(&self, attempts: usize) {
        self.backend_calls
            .fetch_add(attempts as u64, Ordering::Relaxed);
        if attempts > 1 {
            bump(&self.failovers);
        }
    }

    pub fn record_deadline_exceeded(&self) {
        bump(&self.deadline_exceeded);
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    /// Counts a request that ended in error at `stage`.
    pub fn record_stage_error(&self, stage: Stage) {
        match stage {
            Stage::Received => bump(&self.invalid_requests),
            Stage::Authenticated => bump(&self.auth_failed),
            Stage::RateChecked => bump(&self.rate_limited),
            Stage::BudgetChecked => bump(&self.budget_exceeded),
            Stage::Routed => bump(&self.routing_failed),
            Stage::Dispatched | Stage::Accounted | Stage::Completed => {
                bump(&self.dispatch_failed)
            }
        }
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            completed: load(&self.completed),
            invalid_requests: load(&self.invalid_requests),
            auth_failed: load(&self.auth_failed),
            rate_limited: load(&self.rate_limited),
            budget_exceeded: load(&self.budget_exceeded),
            routing_failed: load(&self.routing_failed),
            backend_calls: load(&self.backend_calls),
            failovers: load(&self.failovers),
            dispatch_failed: load(&self.dispatch_failed),
            deadline_exceeded: load(&self.deadline_exceeded),
            cancelled: load(&self.cancelled),
        }
    }
}
