//! Periodic sweeps: approval expiry, approval escalation, and due retries.
//!
//! Each sweep runs per organization under a lease named
//! `sweep:<kind>:<organization>` so several daemons sharing one backend do
//! not process the same records concurrently.

use std::sync::Arc;
use std::time::Duration;

use mender_core::OrganizationId;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::engine::RemediationEngine;
use crate::error::EngineError;

/// Configuration for the [`BackgroundSweeper`].
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often pending approvals are checked for expiry (default: 60 seconds).
    pub expiry_interval: Duration,
    /// How often pending approvals are checked for escalation (default: 300 seconds).
    pub escalation_interval: Duration,
    /// How often scheduled executions are checked (default: 15 seconds).
    pub retry_interval: Duration,
    /// Lease held for the duration of one sweep (default: 30 seconds).
    pub lock_ttl: Duration,
    pub enable_expiry: bool,
    pub enable_escalation: bool,
    pub enable_retries: bool,
    /// Organizations swept on every tick.
    pub organizations: Vec<OrganizationId>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(60),
            escalation_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(15),
            lock_ttl: Duration::from_secs(30),
            enable_expiry: true,
            enable_escalation: true,
            enable_retries: true,
            organizations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    Expiry,
    Escalation,
    Retries,
}

impl SweepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expiry => "expiry",
            Self::Escalation => "escalation",
            Self::Retries => "retries",
        }
    }

    /// Lock name leasing this sweep for one organization.
    pub fn lease_name(self, organization: &OrganizationId) -> String {
        format!("sweep:{}:{organization}", self.as_str())
    }
}

/// Records processed by one pass over every sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub escalated: usize,
    pub retried: usize,
}

/// Runs the engine's periodic sweeps until told to stop.
pub struct BackgroundSweeper {
    engine: Arc<RemediationEngine>,
    config: SweepConfig,
    shutdown_rx: mpsc::Receiver<()>,
}

impl BackgroundSweeper {
    pub fn new(
        engine: Arc<RemediationEngine>,
        config: SweepConfig,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            config,
            shutdown_rx,
        }
    }

    /// Run one sweep kind for one organization under its lease.
    ///
    /// Returns `Ok(None)` when another owner holds the lease.
    pub async fn sweep(
        &self,
        kind: SweepKind,
        organization: &OrganizationId,
    ) -> Result<Option<usize>, EngineError> {
        let lease = kind.lease_name(organization);
        let Some(guard) = self
            .engine
            .lock()
            .try_acquire(&lease, self.config.lock_ttl)
            .await?
        else {
            debug!(%lease, "sweep lease held elsewhere, skipping");
            return Ok(None);
        };

        let result = match kind {
            SweepKind::Expiry => self.engine.process_expired_approvals(organization).await,
            SweepKind::Escalation => self.engine.escalate_pending_approvals(organization).await,
            SweepKind::Retries => self.engine.run_due_retries(organization).await,
        };

        if let Err(e) = guard.release().await {
            warn!(%lease, error = %e, "failed to release sweep lease");
        }
        result.map(Some)
    }

    /// Run `kind` for every configured organization. Returns the total
    /// processed; per-organization failures are logged.
    pub async fn sweep_all(&self, kind: SweepKind) -> usize {
        let mut total = 0;
        for organization in &self.config.organizations {
            match self.sweep(kind, organization).await {
                Ok(Some(count)) => total += count,
                Ok(None) => {}
                Err(e) => error!(
                    sweep = kind.as_str(),
                    org = %organization,
                    error = %e,
                    "sweep failed"
                ),
            }
        }
        total
    }

    /// Run every enabled sweep once.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.config.enable_expiry {
            report.expired = self.sweep_all(SweepKind::Expiry).await;
        }
        if self.config.enable_escalation {
            report.escalated = self.sweep_all(SweepKind::Escalation).await;
        }
        if self.config.enable_retries {
            report.retried = self.sweep_all(SweepKind::Retries).await;
        }
        report
    }

    /// Run sweeps on their intervals until a shutdown signal arrives.
    pub async fn run(&mut self) {
        info!(organizations = self.config.organizations.len(), "background sweeper starting");

        let mut expiry_interval = interval(self.config.expiry_interval);
        let mut escalation_interval = interval(self.config.escalation_interval);
        let mut retry_interval = interval(self.config.retry_interval);
        for ticker in [&mut expiry_interval, &mut escalation_interval, &mut retry_interval] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("background sweeper received shutdown signal");
                    break;
                }
                _ = expiry_interval.tick(), if self.config.enable_expiry => {
                    let expired = self.sweep_all(SweepKind::Expiry).await;
                    debug!(expired, "expiry sweep done");
                }
                _ = escalation_interval.tick(), if self.config.enable_escalation => {
                    let escalated = self.sweep_all(SweepKind::Escalation).await;
                    debug!(escalated, "escalation sweep done");
                }
                _ = retry_interval.tick(), if self.config.enable_retries => {
                    let retried = self.sweep_all(SweepKind::Retries).await;
                    debug!(retried, "retry sweep done");
                }
            }
        }

        info!("background sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_names_are_per_kind_and_organization() {
        let org = OrganizationId::new("acme");
        assert_eq!(SweepKind::Expiry.lease_name(&org), "sweep:expiry:acme");
        assert_eq!(SweepKind::Retries.lease_name(&org), "sweep:retries:acme");
        assert_ne!(
            SweepKind::Escalation.lease_name(&org),
            SweepKind::Escalation.lease_name(&OrganizationId::new("globex"))
        );
    }

    #[test]
    fn defaults_match_documented_intervals() {
        let config = SweepConfig::default();
        assert_eq!(config.expiry_interval, Duration::from_secs(60));
        assert_eq!(config.escalation_interval, Duration::from_secs(300));
        assert_eq!(config.retry_interval, Duration::from_secs(15));
        assert!(config.organizations.is_empty());
    }
}
