//! The action executor core.
//!
//! Owns the [`ActionExecution`] lifecycle. Every status change goes through
//! [`ActionExecutor::transition`], which performs a conditional update and
//! then writes exactly one audit entry. If the audit write fails before the
//! handler has run, the update is reverted and the operation reports
//! [`EngineError::Audit`]. Once the handler has run its outcome stands: the
//! update is kept, claims and notifications are handled as usual, the entry
//! waits in the trail's backlog, and the operation still reports
//! [`EngineError::Audit`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_audit::{AuditEntry, AuditError, AuditSeverity};
use mender_core::{
    ActionExecution, ActorId, AutomatedAction, ExecutionId, ExecutionStatus, Notification,
    NotificationKind, OrganizationId, TriggerContext,
};
use mender_handler::{
    DynHandler, HandlerError, HandlerOutcome, HandlerRegistry, HandlerResult, Notifier, notify_all,
};
use mender_retry::ExponentialBackoff;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::records::{Change, Records};
use crate::trail::{self, AuditTrail};

/// One status change and the audit entry that describes it.
struct Step {
    from: &'static [ExecutionStatus],
    to: ExecutionStatus,
    event: &'static str,
    description: String,
    severity: AuditSeverity,
    actor: Option<ActorId>,
    details: Value,
}

impl Step {
    fn new(to: ExecutionStatus, event: &'static str, description: impl Into<String>) -> Self {
        Self {
            from: &[],
            to,
            event,
            description: description.into(),
            severity: AuditSeverity::Info,
            actor: None,
            details: Value::Null,
        }
    }

    fn only_from(mut self, from: &'static [ExecutionStatus]) -> Self {
        self.from = from;
        self
    }

    fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    fn actor(mut self, actor: Option<&ActorId>) -> Self {
        self.actor = actor.cloned();
        self
    }

    fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A transition recorded after the handler ran. The status change is kept
/// even when its audit entry had to be deferred.
struct Settled {
    execution: ActionExecution,
    audit_error: Option<AuditError>,
}

impl Settled {
    fn into_result(self) -> Result<ActionExecution, EngineError> {
        match self.audit_error {
            Some(e) => Err(e.into()),
            None => Ok(self.execution),
        }
    }
}

const CANCELLABLE: &[ExecutionStatus] =
    &[ExecutionStatus::AwaitingApproval, ExecutionStatus::Scheduled];

fn chrono_delay(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Drives executions through their state machine and dispatches to handlers.
#[derive(Clone)]
pub struct ActionExecutor {
    records: Records,
    audit: AuditTrail,
    handlers: Arc<HandlerRegistry>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<EngineMetrics>,
    backoff: ExponentialBackoff,
}

impl ActionExecutor {
    pub fn new(
        records: Records,
        audit: AuditTrail,
        handlers: Arc<HandlerRegistry>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            records,
            audit,
            handlers,
            notifier,
            metrics,
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Replace the backoff used when a handler reports a retryable error.
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn handler_for(&self, action: &AutomatedAction) -> Result<Arc<dyn DynHandler>, EngineError> {
        self.handlers.get(action.action_type).ok_or_else(|| {
            EngineError::Configuration(format!(
                "no handler registered for action type {}",
                action.action_type
            ))
        })
    }

    /// Check an action's configuration against its handler.
    pub fn validate(&self, action: &AutomatedAction) -> Result<Arc<dyn DynHandler>, EngineError> {
        let handler = self.handler_for(action)?;
        if action.config.action_type() != action.action_type {
            return Err(EngineError::Validation(format!(
                "action {} is typed {} but carries a {} config",
                action.id,
                action.action_type,
                action.config.action_type()
            )));
        }
        handler
            .validate(&action.config)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        Ok(handler)
    }

    async fn load(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
    ) -> Result<(ActionExecution, AutomatedAction), EngineError> {
        let execution = self
            .records
            .get_execution(organization, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {id}")))?;
        let action = self
            .records
            .get_action(organization, &execution.action_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("action {}", execution.action_id)))?;
        Ok((execution, action))
    }

    async fn transition<F>(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        step: Step,
        mutate: F,
    ) -> Result<ActionExecution, EngineError>
    where
        F: FnMut(&mut ActionExecution) + Send,
    {
        let to = step.to;
        let (change, entry) = self.apply(organization, id, step, mutate).await?;
        if let Err(e) = self.audit.record(entry).await {
            error!(
                execution_id = %id,
                %to,
                error = %e,
                "audit write failed, reverting transition"
            );
            self.records.revert_execution(&change).await;
            return Err(e.into());
        }
        Ok(change.after)
    }

    /// Like [`transition`](Self::transition), for steps that record a handler
    /// call. The status change is never reverted; a refused audit entry is
    /// deferred and reported on the returned [`Settled`].
    async fn settle<F>(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        step: Step,
        mutate: F,
    ) -> Result<Settled, EngineError>
    where
        F: FnMut(&mut ActionExecution) + Send,
    {
        let to = step.to;
        let (change, entry) = self.apply(organization, id, step, mutate).await?;
        let audit_error = self.audit.record_or_defer(entry).await.err();
        if let Some(ref e) = audit_error {
            error!(
                execution_id = %id,
                %to,
                error = %e,
                "audit write failed, keeping handler outcome"
            );
            self.metrics.increment_audit_deferred();
        }
        Ok(Settled {
            execution: change.after,
            audit_error,
        })
    }

    /// Apply the status change and build its audit entry.
    async fn apply<F>(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        step: Step,
        mutate: F,
    ) -> Result<(Change<ActionExecution>, AuditEntry), EngineError>
    where
        F: FnMut(&mut ActionExecution) + Send,
    {
        let change = self
            .records
            .transition_execution(organization, id, step.from, step.to, mutate)
            .await?;

        let mut details = step.details;
        if let Value::Object(ref mut fields) = details {
            fields.insert("from_status".into(), json!(change.before.status));
        } else {
            details = json!({ "from_status": change.before.status });
        }
        let mut entry = trail::execution_entry(&change.after, step.event, step.description, details)
            .with_severity(step.severity);
        if let Some(actor) = step.actor {
            entry = entry.with_actor(actor.as_str());
        }
        Ok((change, entry))
    }

    async fn release_claim(&self, execution: &ActionExecution) {
        let Some(target) = execution.target_id.as_deref() else {
            return;
        };
        match self
            .records
            .release_target(
                &execution.organization_id,
                &execution.action_id,
                target,
                &execution.id,
            )
            .await
        {
            Ok(true) => debug!(execution_id = %execution.id, target_id = target, "claim released"),
            Ok(false) => {}
            Err(e) => error!(
                execution_id = %execution.id,
                target_id = target,
                error = %e,
                "failed to release target claim"
            ),
        }
    }

    /// Create an execution for `action` and, unless approval is required,
    /// run it inline.
    ///
    /// Validation failures and unresolvable targets return an error before
    /// any execution exists. Handler failures do not: they are recorded on
    /// the returned execution.
    #[instrument(
        name = "executor.trigger",
        skip_all,
        fields(action_id = %action.id, org = %action.organization_id)
    )]
    pub async fn trigger(
        &self,
        action: &AutomatedAction,
        context: TriggerContext,
    ) -> Result<ActionExecution, EngineError> {
        if !action.enabled {
            return Err(EngineError::Validation(format!("action {} is disabled", action.id)));
        }
        let handler = self.validate(action)?;
        let org = &action.organization_id;
        let execution = ActionExecution::new(action, context);

        if execution.target_id.is_none() && action.config.requires_target() {
            let kind = action.config.target_entity_type().unwrap_or("target");
            let entry = trail::execution_entry(
                &execution,
                "execution.target_unresolved",
                format!("trigger named no {kind}"),
                json!({ "trigger_reason": execution.trigger_reason }),
            )
            .with_severity(AuditSeverity::Warning);
            self.audit.record(entry).await?;
            return Err(EngineError::TargetResolution(format!(
                "action {} needs a {kind} id and the trigger context has none",
                action.id
            )));
        }

        if let Some(target) = execution.target_id.as_deref()
            && !self
                .records
                .claim_target(org, &action.id, target, &execution.id)
                .await?
        {
            self.metrics.increment_conflicts();
            warn!(target_id = target, "active execution already holds target");
            return Err(EngineError::Conflict {
                action_id: action.id.to_string(),
                target_id: target.to_owned(),
            });
        }

        if let Err(e) = self.create(&execution).await {
            self.release_claim(&execution).await;
            return Err(e);
        }
        self.metrics.increment_triggered();
        info!(execution_id = %execution.id, target_id = ?execution.target_id, "execution created");

        if action.requires_approval {
            return self
                .transition(
                    org,
                    &execution.id,
                    Step::new(
                        ExecutionStatus::AwaitingApproval,
                        "execution.awaiting_approval",
                        "waiting for approval",
                    ),
                    |_| {},
                )
                .await;
        }

        let ready = self
            .transition(
                org,
                &execution.id,
                Step::new(ExecutionStatus::Ready, "execution.ready", "no approval required"),
                |_| {},
            )
            .await?;
        self.run(action, handler.as_ref(), ready).await
    }

    async fn create(&self, execution: &ActionExecution) -> Result<(), EngineError> {
        self.records.insert_execution(execution).await?;
        let entry = trail::execution_entry(
            execution,
            "execution.created",
            format!("triggered: {}", execution.trigger_reason),
            json!({
                "trigger_reason": execution.trigger_reason,
                "pattern_type": execution.context.pattern.as_ref().map(|p| p.pattern_type.clone()),
            }),
        );
        let entry = match execution.context.triggered_by {
            Some(ref actor) => entry.with_actor(actor.as_str()),
            None => entry,
        };
        if let Err(e) = self.audit.record(entry).await {
            error!(execution_id = %execution.id, error = %e, "audit write failed, discarding execution");
            if let Err(discard) = self.records.discard_execution(execution).await {
                error!(execution_id = %execution.id, error = %discard, "failed to discard execution");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Invoke the handler for a `Ready` or `Scheduled` execution.
    async fn run(
        &self,
        action: &AutomatedAction,
        handler: &dyn DynHandler,
        execution: ActionExecution,
    ) -> Result<ActionExecution, EngineError> {
        let org = &action.organization_id;
        let attempt = execution.metrics.attempts + 1;
        let started = self
            .transition(
                org,
                &execution.id,
                Step::new(
                    ExecutionStatus::Executing,
                    "execution.started",
                    format!("attempt {attempt}"),
                )
                .only_from(&[ExecutionStatus::Ready, ExecutionStatus::Scheduled]),
                |e| {
                    e.metrics.attempts += 1;
                    e.started_at.get_or_insert_with(Utc::now);
                    e.next_attempt_at = None;
                },
            )
            .await?;

        let clock = tokio::time::Instant::now();
        let outcome = handler.execute(action, &started).await;
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(HandlerOutcome::Completed(result)) => {
                self.complete(handler, &started, result, duration_ms).await
            }
            Ok(HandlerOutcome::Deferred {
                not_before,
                reason,
                attempted,
            }) => {
                self.schedule(&started, not_before, reason, None, attempted, duration_ms)
                    .await
            }
            Err(err) if err.is_retryable() && started.metrics.attempts < action.max_attempts => {
                let delay = self.backoff.delay_for(started.metrics.attempts);
                let not_before = Utc::now() + chrono_delay(delay);
                self.schedule(
                    &started,
                    not_before,
                    format!("retrying after error: {err}"),
                    Some(&err),
                    true,
                    duration_ms,
                )
                .await
            }
            Err(err) => self.fail(&started, &err, duration_ms).await,
        }
    }

    async fn complete(
        &self,
        handler: &dyn DynHandler,
        execution: &ActionExecution,
        result: HandlerResult,
        duration_ms: u64,
    ) -> Result<ActionExecution, EngineError> {
        let rollback_data = result.rollback_data.filter(|_| handler.can_rollback());
        let changes = result.changes;
        let details = json!({
            "changes": changes,
            "rollback_available": rollback_data.is_some(),
            "duration_ms": duration_ms,
        });
        let payload = result.result;
        let settled = self
            .settle(
                &execution.organization_id,
                &execution.id,
                Step::new(
                    ExecutionStatus::Completed,
                    "execution.completed",
                    format!("completed with {} change(s)", changes.len()),
                )
                .details(details),
                |e| {
                    e.result = Some(payload.clone());
                    e.metrics.changes_applied = changes.len();
                    e.changes.clone_from(&changes);
                    e.rollback_data.clone_from(&rollback_data);
                    e.metrics.duration_ms = Some(duration_ms);
                    e.completed_at = Some(Utc::now());
                    e.error_message = None;
                },
            )
            .await?;
        let completed = &settled.execution;
        self.release_claim(completed).await;
        self.metrics.increment_completed();
        info!(
            execution_id = %completed.id,
            changes = completed.metrics.changes_applied,
            duration_ms,
            "execution completed"
        );
        settled.into_result()
    }

    async fn schedule(
        &self,
        execution: &ActionExecution,
        not_before: DateTime<Utc>,
        reason: String,
        error: Option<&HandlerError>,
        attempted: bool,
        duration_ms: u64,
    ) -> Result<ActionExecution, EngineError> {
        let severity = if error.is_some() {
            AuditSeverity::Warning
        } else {
            AuditSeverity::Info
        };
        let error_message = error.map(ToString::to_string);
        let settled = self
            .settle(
                &execution.organization_id,
                &execution.id,
                Step::new(ExecutionStatus::Scheduled, "execution.scheduled", reason.clone())
                    .severity(severity)
                    .details(json!({
                        "next_attempt_at": not_before,
                        "error": error_message,
                        "attempted": attempted,
                    })),
                |e| {
                    e.next_attempt_at = Some(not_before);
                    e.error_message = Some(error_message.clone().unwrap_or_else(|| reason.clone()));
                    e.metrics.duration_ms = Some(duration_ms);
                    if !attempted {
                        e.metrics.attempts = e.metrics.attempts.saturating_sub(1);
                    }
                },
            )
            .await?;
        self.metrics.increment_scheduled();
        info!(execution_id = %settled.execution.id, %not_before, "execution scheduled");
        settled.into_result()
    }

    async fn fail(
        &self,
        execution: &ActionExecution,
        err: &HandlerError,
        duration_ms: u64,
    ) -> Result<ActionExecution, EngineError> {
        let message = err.to_string();
        let settled = self
            .settle(
                &execution.organization_id,
                &execution.id,
                Step::new(ExecutionStatus::Failed, "execution.failed", message.clone())
                    .severity(AuditSeverity::Error)
                    .details(json!({ "error": message, "retryable": err.is_retryable() })),
                |e| {
                    e.error_message = Some(message.clone());
                    e.metrics.duration_ms = Some(duration_ms);
                    e.completed_at = Some(Utc::now());
                },
            )
            .await?;
        let failed = &settled.execution;
        self.release_claim(failed).await;
        self.metrics.increment_failed();
        warn!(execution_id = %failed.id, error = %message, "execution failed");

        if let Some(ref requester) = failed.context.triggered_by {
            let note = Notification::new(
                failed.organization_id.clone(),
                requester.clone(),
                NotificationKind::ExecutionFailed,
                "Remediation failed",
                format!("Execution {} of action {} failed: {message}", failed.id, failed.action_id),
            )
            .with_metadata(json!({ "execution_id": failed.id, "action_id": failed.action_id }));
            notify_all(self.notifier.as_ref(), vec![note]).await;
        }
        settled.into_result()
    }

    /// Move an `AwaitingApproval` execution to `Ready` and run it.
    #[instrument(name = "executor.approve", skip_all, fields(execution_id = %id, %approver))]
    pub async fn approve(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        approver: &ActorId,
    ) -> Result<ActionExecution, EngineError> {
        let (_, action) = self.load(organization, id).await?;
        let handler = self.handler_for(&action)?;
        let ready = self
            .transition(
                organization,
                id,
                Step::new(
                    ExecutionStatus::Ready,
                    "execution.approved",
                    format!("approved by {approver}"),
                )
                .only_from(&[ExecutionStatus::AwaitingApproval])
                .actor(Some(approver)),
                |e| e.approved_by = Some(approver.clone()),
            )
            .await?;
        self.run(&action, handler.as_ref(), ready).await
    }

    /// Cancel an execution waiting for approval or for its next attempt.
    ///
    /// A handler call already in flight is not interrupted.
    #[instrument(name = "executor.cancel", skip_all, fields(execution_id = %id))]
    pub async fn cancel(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        actor: Option<&ActorId>,
        reason: &str,
    ) -> Result<ActionExecution, EngineError> {
        let cancelled = self
            .transition(
                organization,
                id,
                Step::new(ExecutionStatus::Cancelled, "execution.cancelled", reason)
                    .only_from(CANCELLABLE)
                    .actor(actor)
                    .details(json!({ "reason": reason })),
                |e| {
                    e.cancelled_by = actor.cloned();
                    e.next_attempt_at = None;
                    e.completed_at = Some(Utc::now());
                },
            )
            .await?;
        self.release_claim(&cancelled).await;
        self.metrics.increment_cancelled();
        info!(reason, "execution cancelled");
        Ok(cancelled)
    }

    /// Reverse a completed execution.
    ///
    /// Returns `false` without touching state when the execution is not
    /// eligible, and `false` after recording `RollbackFailed` when the
    /// handler's rollback fails.
    #[instrument(name = "executor.rollback", skip_all, fields(execution_id = %id, %actor))]
    pub async fn rollback(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        actor: &ActorId,
    ) -> Result<bool, EngineError> {
        let (execution, action) = self.load(organization, id).await?;
        let handler = self.handler_for(&action)?;
        if execution.status != ExecutionStatus::Completed
            || !handler.can_rollback()
            || execution.rollback_data.is_none()
        {
            warn!(status = %execution.status, "execution is not eligible for rollback");
            return Ok(false);
        }

        let requested = match self
            .transition(
                organization,
                id,
                Step::new(
                    ExecutionStatus::RollbackRequested,
                    "execution.rollback_requested",
                    format!("rollback requested by {actor}"),
                )
                .actor(Some(actor)),
                |e| e.rolled_back_by = Some(actor.clone()),
            )
            .await
        {
            Ok(requested) => requested,
            Err(EngineError::InvalidTransition { from, .. }) => {
                warn!(status = %from, "execution left Completed before rollback");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let data = requested.rollback_data.clone().unwrap_or(Value::Null);
        match handler.rollback(&action, id, &data).await {
            Ok(()) => {
                let settled = self
                    .settle(
                        organization,
                        id,
                        Step::new(ExecutionStatus::RolledBack, "execution.rolled_back", "rollback applied")
                            .actor(Some(actor)),
                        |_| {},
                    )
                    .await?;
                self.metrics.increment_rolled_back();
                info!("execution rolled back");
                settled.into_result().map(|_| true)
            }
            Err(err) => {
                let message = err.to_string();
                let settled = self
                    .settle(
                        organization,
                        id,
                        Step::new(ExecutionStatus::RollbackFailed, "execution.rollback_failed", message.clone())
                            .severity(AuditSeverity::Error)
                            .actor(Some(actor))
                            .details(json!({ "error": message })),
                        |e| e.rollback_error = Some(message.clone()),
                    )
                    .await?;
                self.metrics.increment_rollback_failed();
                warn!(error = %message, "rollback failed");
                let note = Notification::new(
                    organization.clone(),
                    actor.clone(),
                    NotificationKind::RollbackFailed,
                    "Rollback failed",
                    format!("Rollback of execution {id} failed: {message}"),
                )
                .with_metadata(json!({ "execution_id": id, "action_id": action.id }));
                notify_all(self.notifier.as_ref(), vec![note]).await;
                settled.into_result().map(|_| false)
            }
        }
    }

    /// Run every `Scheduled` execution whose next attempt is due at `now`.
    ///
    /// Each execution is claimed by its `Scheduled -> Executing` update, so
    /// concurrent callers never run the same execution twice. Returns how
    /// many were run.
    #[instrument(name = "executor.run_due", skip_all, fields(org = %organization))]
    pub async fn run_due(
        &self,
        organization: &OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let due = self.records.due_executions(organization, now).await?;
        let mut ran = 0;
        for execution in due {
            let Some(action) = self
                .records
                .get_action(organization, &execution.action_id)
                .await?
            else {
                warn!(execution_id = %execution.id, action_id = %execution.action_id, "due execution has no action");
                continue;
            };
            let handler = match self.handler_for(&action) {
                Ok(handler) => handler,
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "skipping due execution");
                    continue;
                }
            };
            let id = execution.id.clone();
            match self.run(&action, handler.as_ref(), execution).await {
                Ok(_) => ran += 1,
                Err(EngineError::InvalidTransition { .. }) => {
                    debug!(execution_id = %id, "due execution already taken");
                }
                Err(e) => error!(execution_id = %id, error = %e, "due execution run failed"),
            }
        }
        Ok(ran)
    }
}
