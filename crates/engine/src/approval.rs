//! Approval gating in front of the executor.
//!
//! Requests move `pending -> {approved, rejected, expired}` exactly once.
//! Expiry is applied by the periodic sweep and lazily when a decision
//! arrives after the deadline. Escalation is independent of expiry.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mender_audit::AuditSeverity;
use mender_core::{
    ActionExecution, ActorId, ApprovalDecision, ApprovalId, ApprovalPolicy, ApprovalPriority,
    ApprovalQuery, ApprovalRequest, ApprovalStatus, AutomatedAction, Decision, DetectedPattern,
    ExecutionStatus, Notification, NotificationKind, OrganizationId, RiskLevel, Severity,
};
use mender_handler::{ActorDirectory, Notifier, notify_all};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, PolicyError};
use crate::executor::ActionExecutor;
use crate::metrics::EngineMetrics;
use crate::records::{Change, Records};
use crate::trail::{self, AuditTrail};

/// Affected-entity count above which a request is raised to `high`.
pub const WIDE_IMPACT_ENTITIES: usize = 10;

/// Priority for a request from the triggering pattern and risk assessment.
///
/// The first matching rule wins: critical severity or high risk is
/// `urgent`; high severity or more than [`WIDE_IMPACT_ENTITIES`] affected
/// entities is `high`; medium severity is `normal`; anything else is `low`.
pub fn determine_priority(
    pattern: Option<&DetectedPattern>,
    risk: Option<RiskLevel>,
) -> ApprovalPriority {
    let severity = pattern.map(|p| p.severity);
    let affected = pattern.map_or(0, |p| p.affected_entities.len());
    if severity == Some(Severity::Critical) || risk == Some(RiskLevel::High) {
        ApprovalPriority::Urgent
    } else if severity == Some(Severity::High) || affected > WIDE_IMPACT_ENTITIES {
        ApprovalPriority::High
    } else if severity == Some(Severity::Medium) {
        ApprovalPriority::Normal
    } else {
        ApprovalPriority::Low
    }
}

fn hours(h: u32) -> Duration {
    Duration::hours(i64::from(h))
}

/// Result of a decision on an approval request.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub request: ApprovalRequest,
    pub execution: ActionExecution,
}

/// Creates and resolves approval requests, and runs the expiry and
/// escalation sweeps.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    records: Records,
    audit: AuditTrail,
    executor: ActionExecutor,
    directory: Arc<dyn ActorDirectory>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<EngineMetrics>,
}

impl ApprovalWorkflow {
    pub fn new(
        records: Records,
        audit: AuditTrail,
        executor: ActionExecutor,
        directory: Arc<dyn ActorDirectory>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            records,
            audit,
            executor,
            directory,
            notifier,
            metrics,
        }
    }

    async fn actors_with_roles(&self, organization: &OrganizationId, roles: &[String]) -> Vec<ActorId> {
        match self.directory.actors_with_roles(organization, roles).await {
            Ok(actors) => actors,
            Err(e) => {
                warn!(org = %organization, ?roles, error = %e, "actor directory lookup failed");
                Vec::new()
            }
        }
    }

    /// Audit an approval change, reverting it if the audit write fails.
    async fn commit(
        &self,
        change: &Change<ApprovalRequest>,
        entry: mender_audit::AuditEntry,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.audit.record(entry).await {
            error!(approval_id = %change.after.id, error = %e, "audit write failed, reverting request");
            self.records.revert_approval(change).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Open a request gating `execution` and notify its approvers.
    #[instrument(
        name = "approval.create",
        skip_all,
        fields(execution_id = %execution.id, action_id = %action.id)
    )]
    pub async fn create_request(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
        policy: &ApprovalPolicy,
    ) -> Result<ApprovalRequest, EngineError> {
        let org = &execution.organization_id;
        let roles = if action.approver_roles.is_empty() {
            &policy.approver_roles
        } else {
            &action.approver_roles
        };
        let assigned_to = self.actors_with_roles(org, roles).await;
        if assigned_to.is_empty() {
            warn!(?roles, "no actor holds an approver role");
        }

        let now = Utc::now();
        let request = ApprovalRequest {
            id: ApprovalId::generate(),
            organization_id: org.clone(),
            execution_id: execution.id.clone(),
            action_id: action.id.clone(),
            priority: determine_priority(execution.context.pattern.as_ref(), execution.context.risk),
            trigger_reason: execution.trigger_reason.clone(),
            context: execution.context.pattern.clone(),
            status: ApprovalStatus::Pending,
            requested_by: execution.context.triggered_by.clone(),
            assigned_to,
            created_at: now,
            expires_at: now + hours(policy.expiration_hours),
            escalated_at: None,
            decided_at: None,
            decided_by: None,
            decision_reason: None,
        };

        self.records.insert_approval(&request).await?;
        let entry = trail::approval_entry(
            &request,
            "approval.requested",
            format!("approval requested for action {}", action.name),
            json!({ "assigned_to": request.assigned_to, "expires_at": request.expires_at }),
        );
        if let Err(e) = self.audit.record(entry).await {
            error!(approval_id = %request.id, error = %e, "audit write failed, discarding request");
            if let Err(discard) = self.records.discard_approval(&request).await {
                error!(approval_id = %request.id, error = %discard, "failed to discard request");
            }
            return Err(e.into());
        }
        self.metrics.increment_approvals_requested();
        info!(approval_id = %request.id, priority = %request.priority, "approval requested");

        let notes = request
            .assigned_to
            .iter()
            .map(|approver| {
                Notification::new(
                    org.clone(),
                    approver.clone(),
                    NotificationKind::ApprovalRequested,
                    format!("Approval needed: {}", action.name),
                    format!(
                        "{} ({} priority). Expires at {}.",
                        request.trigger_reason, request.priority, request.expires_at
                    ),
                )
                .with_metadata(json!({
                    "approval_id": request.id,
                    "execution_id": request.execution_id,
                    "priority": request.priority,
                }))
            })
            .collect();
        notify_all(self.notifier.as_ref(), notes).await;
        Ok(request)
    }

    /// The live request gating `execution_id`, if any.
    pub async fn pending_for(
        &self,
        organization: &OrganizationId,
        execution_id: &mender_core::ExecutionId,
    ) -> Result<Option<ApprovalRequest>, EngineError> {
        let query = ApprovalQuery {
            status: Some(ApprovalStatus::Pending),
            execution_id: Some(execution_id.clone()),
            ..ApprovalQuery::default()
        };
        Ok(self
            .records
            .find_approvals(organization, &query)
            .await?
            .into_iter()
            .next())
    }

    /// Apply an approver's decision.
    ///
    /// A request past its deadline is expired here and the decision is
    /// rejected with [`PolicyError::Expired`].
    #[instrument(name = "approval.decide", skip_all, fields(approval_id = %request_id, decided_by = %decision.decided_by))]
    pub async fn process_decision(
        &self,
        organization: &OrganizationId,
        request_id: &ApprovalId,
        decision: ApprovalDecision,
        policy: &ApprovalPolicy,
    ) -> Result<DecisionOutcome, EngineError> {
        let request = self
            .records
            .get_approval(organization, request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval request {request_id}")))?;
        if request.status.is_decided() {
            return Err(PolicyError::AlreadyDecided {
                id: request.id,
                status: request.status,
            }
            .into());
        }
        let now = Utc::now();
        if request.is_stale(now) {
            self.expire(&request, policy, now).await?;
            return Err(PolicyError::Expired(request.id).into());
        }

        let status = match decision.decision {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        };
        let change = self
            .records
            .update_approval(organization, request_id, |r| {
                if r.status.is_decided() {
                    return Err(PolicyError::AlreadyDecided {
                        id: r.id.clone(),
                        status: r.status,
                    }
                    .into());
                }
                if r.is_stale(now) {
                    return Err(PolicyError::Expired(r.id.clone()).into());
                }
                r.status = status;
                r.decided_at = Some(now);
                r.decided_by = Some(decision.decided_by.clone());
                r.decision_reason.clone_from(&decision.reason);
                Ok(())
            })
            .await?;

        let reason = decision.reason.clone().unwrap_or_default();
        let (event, description, severity) = match decision.decision {
            Decision::Approve => (
                "approval.approved",
                format!("approved by {}", decision.decided_by),
                AuditSeverity::Info,
            ),
            Decision::Reject => (
                "approval.rejected",
                format!("rejected by {}: {reason}", decision.decided_by),
                AuditSeverity::Warning,
            ),
        };
        let entry = trail::approval_entry(
            &change.after,
            event,
            description,
            json!({ "reason": decision.reason }),
        )
        .with_severity(severity)
        .with_actor(decision.decided_by.as_str());
        self.commit(&change, entry).await?;

        let request = change.after;
        let execution = match decision.decision {
            Decision::Approve => {
                self.executor
                    .approve(organization, &request.execution_id, &decision.decided_by)
                    .await?
            }
            Decision::Reject => self.finish_rejection(&request).await?,
        };
        Ok(DecisionOutcome { request, execution })
    }

    /// Cancel the execution behind a rejected request and tell the requester.
    async fn finish_rejection(&self, request: &ApprovalRequest) -> Result<ActionExecution, EngineError> {
        let org = &request.organization_id;
        let reason = request.decision_reason.clone().unwrap_or_default();
        let decided_by = request.decided_by.as_ref();
        let execution = self
            .executor
            .cancel(
                org,
                &request.execution_id,
                decided_by,
                &format!("approval rejected: {reason}"),
            )
            .await?;
        if let Some(ref requester) = request.requested_by {
            let by = decided_by.map_or("an approver", ActorId::as_str);
            let note = Notification::new(
                org.clone(),
                requester.clone(),
                NotificationKind::ApprovalRejected,
                "Remediation rejected",
                format!("{by} rejected execution {}: {reason}", request.execution_id),
            )
            .with_metadata(json!({ "approval_id": request.id, "execution_id": request.execution_id }));
            notify_all(self.notifier.as_ref(), vec![note]).await;
        }
        Ok(execution)
    }

    /// Cancel the execution behind an expired request, if it is still
    /// cancellable, and tell the requester when the policy asks for it.
    async fn finish_expiry(&self, request: &ApprovalRequest, policy: &ApprovalPolicy) -> Result<(), EngineError> {
        let org = &request.organization_id;
        match self
            .executor
            .cancel(org, &request.execution_id, None, "approval expired")
            .await
        {
            Ok(_) => {}
            Err(EngineError::InvalidTransition { from, .. }) => {
                debug!(execution_id = %request.execution_id, status = %from, "execution no longer cancellable");
            }
            Err(e) => return Err(e),
        }

        if policy.notify_requester_on_expiry
            && let Some(ref requester) = request.requested_by
        {
            let note = Notification::new(
                org.clone(),
                requester.clone(),
                NotificationKind::ApprovalExpired,
                "Approval expired",
                format!("Nobody decided on execution {} before {}.", request.execution_id, request.expires_at),
            )
            .with_metadata(json!({ "approval_id": request.id, "execution_id": request.execution_id }));
            notify_all(self.notifier.as_ref(), vec![note]).await;
        }
        Ok(())
    }

    /// Mark one request expired and cancel its execution. `false` if the
    /// request was decided in the meantime.
    async fn expire(
        &self,
        request: &ApprovalRequest,
        policy: &ApprovalPolicy,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let org = &request.organization_id;
        let change = match self
            .records
            .update_approval(org, &request.id, |r| {
                if r.status.is_decided() {
                    return Err(PolicyError::AlreadyDecided {
                        id: r.id.clone(),
                        status: r.status,
                    }
                    .into());
                }
                r.status = ApprovalStatus::Expired;
                r.decided_at = Some(now);
                Ok(())
            })
            .await
        {
            Ok(change) => change,
            Err(EngineError::Policy(PolicyError::AlreadyDecided { .. })) => return Ok(false),
            Err(e) => return Err(e),
        };
        let entry = trail::approval_entry(
            &change.after,
            "approval.expired",
            "no decision before the deadline",
            json!({ "expires_at": request.expires_at }),
        )
        .with_severity(AuditSeverity::Warning);
        self.commit(&change, entry).await?;
        self.metrics.increment_approvals_expired();
        info!(approval_id = %request.id, "approval request expired");

        self.finish_expiry(&change.after, policy).await?;
        Ok(true)
    }

    /// Carry decisions over to executions still `AwaitingApproval`.
    ///
    /// A request is decided before its execution moves, so an audit outage
    /// between the two leaves the execution waiting on a request that can no
    /// longer be decided. Returns how many executions were settled.
    async fn reconcile_decided(
        &self,
        organization: &OrganizationId,
        policy: &ApprovalPolicy,
    ) -> Result<usize, EngineError> {
        let decided: Vec<ApprovalRequest> = self
            .records
            .find_approvals(organization, &ApprovalQuery::default())
            .await?
            .into_iter()
            .filter(|r| r.status.is_decided())
            .collect();

        let mut settled = 0;
        for request in &decided {
            let waiting = self
                .records
                .get_execution(organization, &request.execution_id)
                .await?
                .is_some_and(|e| e.status == ExecutionStatus::AwaitingApproval);
            if !waiting {
                continue;
            }
            warn!(
                approval_id = %request.id,
                execution_id = %request.execution_id,
                status = %request.status,
                "execution still waiting on a decided request"
            );
            let result = match (request.status, request.decided_by.as_ref()) {
                (ApprovalStatus::Approved, Some(approver)) => self
                    .executor
                    .approve(organization, &request.execution_id, approver)
                    .await
                    .map(|_| ()),
                (ApprovalStatus::Rejected, _) => self.finish_rejection(request).await.map(|_| ()),
                (ApprovalStatus::Expired, _) => self.finish_expiry(request, policy).await,
                _ => continue,
            };
            match result {
                Ok(()) => settled += 1,
                Err(EngineError::InvalidTransition { .. }) => {
                    debug!(execution_id = %request.execution_id, "execution settled concurrently");
                }
                Err(e) => error!(approval_id = %request.id, error = %e, "failed to settle execution"),
            }
        }
        if settled > 0 {
            info!(settled, "settled executions of decided requests");
        }
        Ok(settled)
    }

    /// Expire every pending request past its deadline. Returns how many
    /// were expired by this call.
    ///
    /// Executions left waiting on an already decided request are settled
    /// first; they do not count towards the result.
    #[instrument(name = "approval.expire_sweep", skip_all, fields(org = %organization))]
    pub async fn process_expired(
        &self,
        organization: &OrganizationId,
        policy: &ApprovalPolicy,
    ) -> Result<usize, EngineError> {
        if let Err(e) = self.reconcile_decided(organization, policy).await {
            error!(error = %e, "failed to settle decided requests");
        }

        let now = Utc::now();
        let query = ApprovalQuery {
            status: Some(ApprovalStatus::Pending),
            ..ApprovalQuery::default()
        };
        let stale: Vec<ApprovalRequest> = self
            .records
            .find_approvals(organization, &query)
            .await?
            .into_iter()
            .filter(|r| r.is_stale(now))
            .collect();

        let mut expired = 0;
        for request in &stale {
            match self.expire(request, policy, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => error!(approval_id = %request.id, error = %e, "failed to expire request"),
            }
        }
        if expired > 0 {
            info!(expired, "expired approval requests");
        }
        Ok(expired)
    }

    /// Escalate pending requests older than the policy threshold that have
    /// not been escalated yet. Returns how many were escalated.
    #[instrument(name = "approval.escalate_sweep", skip_all, fields(org = %organization))]
    pub async fn escalate_pending(
        &self,
        organization: &OrganizationId,
        policy: &ApprovalPolicy,
    ) -> Result<usize, EngineError> {
        let now = Utc::now();
        let query = ApprovalQuery {
            status: Some(ApprovalStatus::Pending),
            created_before: Some(now - hours(policy.escalate_after_hours)),
            unescalated_only: true,
            ..ApprovalQuery::default()
        };
        let candidates: Vec<ApprovalRequest> = self
            .records
            .find_approvals(organization, &query)
            .await?
            .into_iter()
            .filter(|r| !r.is_stale(now))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }
        let escalation_targets = self
            .actors_with_roles(organization, &policy.escalation_roles)
            .await;

        let mut escalated = 0;
        for request in &candidates {
            match self.escalate(request, &escalation_targets, now).await {
                Ok(true) => escalated += 1,
                Ok(false) => {}
                Err(e) => error!(approval_id = %request.id, error = %e, "failed to escalate request"),
            }
        }
        if escalated > 0 {
            info!(escalated, "escalated approval requests");
        }
        Ok(escalated)
    }

    async fn escalate(
        &self,
        request: &ApprovalRequest,
        recipients: &[ActorId],
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let org = &request.organization_id;
        let change = match self
            .records
            .update_approval(org, &request.id, |r| {
                if r.status.is_decided() {
                    return Err(PolicyError::AlreadyDecided {
                        id: r.id.clone(),
                        status: r.status,
                    }
                    .into());
                }
                if r.escalated_at.is_some() {
                    return Err(PolicyError::AlreadyEscalated(r.id.clone()).into());
                }
                r.escalated_at = Some(now);
                r.priority = ApprovalPriority::Urgent;
                Ok(())
            })
            .await
        {
            Ok(change) => change,
            Err(EngineError::Policy(
                PolicyError::AlreadyDecided { .. } | PolicyError::AlreadyEscalated(_),
            )) => return Ok(false),
            Err(e) => return Err(e),
        };
        let entry = trail::approval_entry(
            &change.after,
            "approval.escalated",
            format!("pending since {}", request.created_at),
            json!({ "previous_priority": request.priority, "notified": recipients }),
        )
        .with_severity(AuditSeverity::Warning);
        self.commit(&change, entry).await?;
        self.metrics.increment_approvals_escalated();

        let notes = recipients
            .iter()
            .map(|actor| {
                Notification::new(
                    org.clone(),
                    actor.clone(),
                    NotificationKind::ApprovalEscalated,
                    "Approval overdue",
                    format!(
                        "Request {} for execution {} has waited since {}.",
                        request.id, request.execution_id, request.created_at
                    ),
                )
                .with_metadata(json!({ "approval_id": request.id, "priority": ApprovalPriority::Urgent }))
            })
            .collect();
        notify_all(self.notifier.as_ref(), notes).await;
        Ok(true)
    }
}
