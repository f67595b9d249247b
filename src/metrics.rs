use crate::rate_limiter::Decision;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a limiter's decision counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub failed_requests: u64,
    pub cas_conflicts: u64,
}

/// In-process decision counters. Never persisted to the state store.
#[derive(Debug, Default)]
pub struct DecisionMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    failed: AtomicU64,
    cas_conflicts: AtomicU64,
}

impl DecisionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_decision(&self, decision: &Decision) {
        let counter = if decision.is_allowed() {
            &self.allowed
        } else {
            &self.denied
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let allowed_requests = self.allowed.load(Ordering::Relaxed);
        let denied_requests = self.denied.load(Ordering::Relaxed);
        let failed_requests = self.failed.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: allowed_requests + denied_requests + failed_requests,
            allowed_requests,
            denied_requests,
            failed_requests,
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cas_conflicts.store(0, Ordering::Relaxed);
    }
}
