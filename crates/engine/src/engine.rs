use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_audit::{AuditEntry, HashChainAuditStore, HashChainVerification};
use mender_core::{
    ActionExecution, ActionId, ActorId, ApprovalDecision, ApprovalId, ApprovalPolicy,
    ApprovalQuery, ApprovalRequest, AutomatedAction, ExecutionId, ExecutionQuery,
    ExecutionStatus, OrganizationId, Page, TriggerContext,
};
use mender_state::DistributedLock;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::approval::{ApprovalWorkflow, DecisionOutcome};
use crate::error::EngineError;
use crate::executor::ActionExecutor;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::records::Records;
use crate::trail::{self, AuditTrail};

pub const ACTION_ENTITY: &str = "automated_action";

/// Entry point for callers: action registry, triggers, decisions, rollback,
/// queries, and the periodic sweeps.
///
/// Built with [`EngineBuilder`](crate::EngineBuilder).
pub struct RemediationEngine {
    pub(crate) records: Records,
    pub(crate) audit: AuditTrail,
    pub(crate) chain: Option<Arc<HashChainAuditStore>>,
    pub(crate) executor: ActionExecutor,
    pub(crate) approvals: ApprovalWorkflow,
    pub(crate) lock: Arc<dyn DistributedLock>,
    pub(crate) policy: ApprovalPolicy,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) default_max_attempts: u32,
}

impl RemediationEngine {
    /// The approval policy applied to new requests and sweeps.
    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub(crate) fn lock(&self) -> &Arc<dyn DistributedLock> {
        &self.lock
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // -- Actions --

    /// Validate and store an action. Replaces any action with the same id.
    #[instrument(name = "engine.register_action", skip_all, fields(action_id = %action.id))]
    pub async fn register_action(&self, mut action: AutomatedAction) -> Result<AutomatedAction, EngineError> {
        self.executor.validate(&action)?;
        if action.max_attempts == 0 {
            action.max_attempts = self.default_max_attempts;
        }
        self.records.put_action(&action).await?;
        let entry = AuditEntry::new(
            action.organization_id.as_str(),
            "action.registered",
            ACTION_ENTITY,
            action.id.as_str(),
            format!("registered {} action {}", action.action_type, action.name),
        )
        .with_details(json!({
            "action_type": action.action_type,
            "requires_approval": action.requires_approval,
            "enabled": action.enabled,
            "config": action.config,
        }));
        self.audit.record(entry).await?;
        info!(action_type = %action.action_type, "action registered");
        Ok(action)
    }

    pub async fn get_action(
        &self,
        organization: &OrganizationId,
        id: &ActionId,
    ) -> Result<Option<AutomatedAction>, EngineError> {
        self.records.get_action(organization, id).await
    }

    pub async fn list_actions(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<AutomatedAction>, EngineError> {
        self.records.list_actions(organization).await
    }

    // -- Executions --

    /// Trigger a registered action.
    ///
    /// When the action requires approval the returned execution is
    /// `AwaitingApproval` and an approval request has been opened for it.
    pub async fn trigger(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        context: TriggerContext,
    ) -> Result<ActionExecution, EngineError> {
        let action = self
            .records
            .get_action(organization, action_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("action {action_id}")))?;
        let execution = self.executor.trigger(&action, context).await?;
        if execution.status != ExecutionStatus::AwaitingApproval {
            return Ok(execution);
        }

        if let Err(e) = self
            .approvals
            .create_request(&action, &execution, &self.policy)
            .await
        {
            warn!(execution_id = %execution.id, error = %e, "approval request not created, cancelling execution");
            if let Err(cancel) = self
                .executor
                .cancel(organization, &execution.id, None, "approval request could not be created")
                .await
            {
                warn!(execution_id = %execution.id, error = %cancel, "cancel after failed approval request");
            }
            return Err(e);
        }
        Ok(execution)
    }

    /// Approve an execution waiting for approval and run it.
    ///
    /// Routed through the execution's pending approval request when there is
    /// one, so the request and the execution agree.
    pub async fn approve_execution(
        &self,
        organization: &OrganizationId,
        execution_id: &ExecutionId,
        approver: &ActorId,
    ) -> Result<ActionExecution, EngineError> {
        match self.approvals.pending_for(organization, execution_id).await? {
            Some(request) => Ok(self
                .approvals
                .process_decision(
                    organization,
                    &request.id,
                    ApprovalDecision::approve(approver.clone()),
                    &self.policy,
                )
                .await?
                .execution),
            None => self.executor.approve(organization, execution_id, approver).await,
        }
    }

    /// Cancel an execution waiting for approval or for a scheduled retry.
    pub async fn cancel_execution(
        &self,
        organization: &OrganizationId,
        execution_id: &ExecutionId,
        actor: &ActorId,
    ) -> Result<ActionExecution, EngineError> {
        match self.approvals.pending_for(organization, execution_id).await? {
            Some(request) => Ok(self
                .approvals
                .process_decision(
                    organization,
                    &request.id,
                    ApprovalDecision::reject(actor.clone(), format!("cancelled by {actor}")),
                    &self.policy,
                )
                .await?
                .execution),
            None => {
                self.executor
                    .cancel(organization, execution_id, Some(actor), &format!("cancelled by {actor}"))
                    .await
            }
        }
    }

    /// Reverse a completed execution. `false` when it is not eligible or the
    /// handler's rollback failed.
    pub async fn rollback(
        &self,
        organization: &OrganizationId,
        execution_id: &ExecutionId,
        actor: &ActorId,
    ) -> Result<bool, EngineError> {
        self.executor.rollback(organization, execution_id, actor).await
    }

    pub async fn get_execution(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
    ) -> Result<Option<ActionExecution>, EngineError> {
        self.records.get_execution(organization, id).await
    }

    pub async fn list_executions(
        &self,
        organization: &OrganizationId,
        query: &ExecutionQuery,
    ) -> Result<Page<ActionExecution>, EngineError> {
        self.records.list_executions(organization, query).await
    }

    // -- Approvals --

    pub async fn decide(
        &self,
        organization: &OrganizationId,
        request_id: &ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<DecisionOutcome, EngineError> {
        self.approvals
            .process_decision(organization, request_id, decision, &self.policy)
            .await
    }

    pub async fn get_approval(
        &self,
        organization: &OrganizationId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, EngineError> {
        self.records.get_approval(organization, id).await
    }

    pub async fn list_approvals(
        &self,
        organization: &OrganizationId,
        query: &ApprovalQuery,
    ) -> Result<Page<ApprovalRequest>, EngineError> {
        self.records.list_approvals(organization, query).await
    }

    // -- Sweeps --

    pub async fn process_expired_approvals(
        &self,
        organization: &OrganizationId,
    ) -> Result<usize, EngineError> {
        self.approvals.process_expired(organization, &self.policy).await
    }

    pub async fn escalate_pending_approvals(
        &self,
        organization: &OrganizationId,
    ) -> Result<usize, EngineError> {
        self.approvals.escalate_pending(organization, &self.policy).await
    }

    /// Run every scheduled execution whose next attempt is due now.
    pub async fn run_due_retries(&self, organization: &OrganizationId) -> Result<usize, EngineError> {
        self.run_due_retries_at(organization, Utc::now()).await
    }

    /// Run every scheduled execution due at or before `now`.
    ///
    /// Backlogged audit entries are flushed first.
    pub async fn run_due_retries_at(
        &self,
        organization: &OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        if let Err(e) = self.audit.flush().await {
            warn!(backlog = self.audit.backlog_len(), error = %e, "audit backlog still pending");
        }
        self.executor.run_due(organization, now).await
    }

    // -- Audit --

    /// Write audit entries that were deferred while the store was failing.
    /// Returns how many were written.
    pub async fn flush_audit_backlog(&self) -> Result<usize, EngineError> {
        Ok(self.audit.flush().await?)
    }

    /// Audit entries waiting to be written.
    pub fn audit_backlog_len(&self) -> usize {
        self.audit.backlog_len()
    }

    /// Audit entries for one execution, oldest first.
    pub async fn audit_history(
        &self,
        organization: &OrganizationId,
        execution_id: &ExecutionId,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .audit
            .history(organization.as_str(), trail::EXECUTION_ENTITY, execution_id.as_str())
            .await?)
    }

    /// Audit entries for one approval request, oldest first.
    pub async fn approval_history(
        &self,
        organization: &OrganizationId,
        request_id: &ApprovalId,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .audit
            .history(organization.as_str(), trail::APPROVAL_ENTITY, request_id.as_str())
            .await?)
    }

    /// Check the organization's audit hash chain.
    pub async fn verify_audit_chain(
        &self,
        organization: &OrganizationId,
    ) -> Result<HashChainVerification, EngineError> {
        let chain = self
            .chain
            .as_ref()
            .ok_or_else(|| EngineError::Configuration("audit hash chain is disabled".into()))?;
        Ok(chain.verify_chain(organization.as_str()).await?)
    }
}

impl std::fmt::Debug for RemediationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationEngine")
            .field("policy", &self.policy)
            .field("hash_chain", &self.chain.is_some())
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}
