use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters tracking execution and approval outcomes.
///
/// Counters use relaxed ordering. Call [`snapshot`](Self::snapshot) for a
/// point-in-time view.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub triggered: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    /// Attempts deferred to a later retry.
    pub scheduled: AtomicU64,
    pub cancelled: AtomicU64,
    pub rolled_back: AtomicU64,
    pub rollback_failed: AtomicU64,
    /// Triggers rejected because the target already had an active execution.
    pub conflicts: AtomicU64,
    pub approvals_requested: AtomicU64,
    pub approvals_expired: AtomicU64,
    pub approvals_escalated: AtomicU64,
    /// Audit entries queued because the store refused them after the
    /// handler had already run.
    pub audit_deferred: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn increment_triggered(&self) {
        bump(&self.triggered);
    }

    pub fn increment_completed(&self) {
        bump(&self.completed);
    }

    pub fn increment_failed(&self) {
        bump(&self.failed);
    }

    pub fn increment_scheduled(&self) {
        bump(&self.scheduled);
    }

    pub fn increment_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub fn increment_rolled_back(&self) {
        bump(&self.rolled_back);
    }

    pub fn increment_rollback_failed(&self) {
        bump(&self.rollback_failed);
    }

    pub fn increment_conflicts(&self) {
        bump(&self.conflicts);
    }

    pub fn increment_approvals_requested(&self) {
        bump(&self.approvals_requested);
    }

    pub fn increment_approvals_expired(&self) {
        bump(&self.approvals_expired);
    }

    pub fn increment_approvals_escalated(&self) {
        bump(&self.approvals_escalated);
    }

    pub fn increment_audit_deferred(&self) {
        bump(&self.audit_deferred);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            triggered: load(&self.triggered),
            completed: load(&self.completed),
            failed: load(&self.failed),
            scheduled: load(&self.scheduled),
            cancelled: load(&self.cancelled),
            rolled_back: load(&self.rolled_back),
            rollback_failed: load(&self.rollback_failed),
            conflicts: load(&self.conflicts),
            approvals_requested: load(&self.approvals_requested),
            approvals_expired: load(&self.approvals_expired),
            approvals_escalated: load(&self.approvals_escalated),
            audit_deferred: load(&self.audit_deferred),
        }
    }
}

/// A point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub triggered: u64,
    pub completed: u64,
    pub failed: u64,
    pub scheduled: u64,
    pub cancelled: u64,
    pub rolled_back: u64,
    pub rollback_failed: u64,
    pub conflicts: u64,
    pub approvals_requested: u64,
    pub approvals_expired: u64,
    pub approvals_escalated: u64,
    pub audit_deferred: u64,
}
