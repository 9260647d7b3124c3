use std::sync::Arc;

use chrono::Utc;
use mender_core::{
    ActionConfig, ActionExecution, ActionType, AutomatedAction, EntityChange, ExecutionId,
    RetryConfig, RetryState, RetryTargetType,
};
use mender_handler::{ActionHandler, HandlerError, HandlerOutcome, HandlerResult};
use mender_state::RetryStateStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::targets::{RetryTargets, TargetRetryResult};

/// Largest accepted `max_attempts`.
pub const MAX_CONFIGURED_ATTEMPTS: u32 = 10;

/// What the handler needs to put a retried target back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RetryRollback {
    target_type: RetryTargetType,
    target_id: String,
    previous_status: String,
}

/// Re-runs a failed job, integration sync, or process step with bounded
/// exponential backoff and per-target attempt tracking.
pub struct RetryHandler {
    targets: Arc<dyn RetryTargets>,
    states: Arc<dyn RetryStateStore>,
}

impl RetryHandler {
    pub fn new(targets: Arc<dyn RetryTargets>, states: Arc<dyn RetryStateStore>) -> Self {
        Self { targets, states }
    }

    fn config(action: &AutomatedAction) -> Result<(&RetryConfig, RetryTargetType), HandlerError> {
        let ActionConfig::Retry(cfg) = &action.config else {
            return Err(HandlerError::InvalidConfig("expected retry config".into()));
        };
        let target_type = cfg
            .target_type
            .ok_or_else(|| HandlerError::InvalidConfig("target_type is required".into()))?;
        Ok((cfg, target_type))
    }

    async fn dispatch(
        &self,
        action: &AutomatedAction,
        target_type: RetryTargetType,
        target_id: &str,
    ) -> Result<TargetRetryResult, HandlerError> {
        let org = &action.organization_id;
        match target_type {
            RetryTargetType::Job => self.targets.retry_job(org, target_id).await,
            RetryTargetType::Integration => self.targets.retry_integration(org, target_id).await,
            RetryTargetType::ProcessStep => self.targets.retry_process_step(org, target_id).await,
        }
    }
}

fn state_error(err: mender_state::StateError) -> HandlerError {
    HandlerError::Collaborator(format!("retry state: {err}"))
}

impl ActionHandler for RetryHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Retry
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError> {
        let ActionConfig::Retry(cfg) = config else {
            return Err(HandlerError::InvalidConfig(format!(
                "expected retry config, got {}",
                config.action_type()
            )));
        };
        if cfg.target_type.is_none() {
            return Err(HandlerError::InvalidConfig(
                "target_type must be one of job, integration, process_step".into(),
            ));
        }
        if !(1..=MAX_CONFIGURED_ATTEMPTS).contains(&cfg.max_attempts) {
            return Err(HandlerError::InvalidConfig(format!(
                "max_attempts must be between 1 and {MAX_CONFIGURED_ATTEMPTS}, got {}",
                cfg.max_attempts
            )));
        }
        if cfg.delay_seconds < 1 {
            return Err(HandlerError::InvalidConfig("delay_seconds must be at least 1".into()));
        }
        if !(cfg.backoff_multiplier.is_finite() && cfg.backoff_multiplier >= 1.0) {
            return Err(HandlerError::InvalidConfig(format!(
                "backoff_multiplier must be at least 1, got {}",
                cfg.backoff_multiplier
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError> {
        let (cfg, target_type) = Self::config(action)?;
        let target_id = execution
            .target_id
            .clone()
            .or_else(|| execution.context.resolve_target(Some(target_type.as_str())))
            .ok_or_else(|| {
                HandlerError::TargetNotFound(format!(
                    "no {} id in trigger context",
                    target_type.as_str()
                ))
            })?;
        let org = &action.organization_id;

        let mut state = self
            .states
            .get(org, &action.id, &target_id)
            .await
            .map_err(state_error)?
            .unwrap_or_else(|| RetryState::new(action.id.clone(), target_id.clone()));

        let attempt = state.attempt_count + 1;
        if attempt > cfg.max_attempts {
            self.states
                .clear(org, &action.id, &target_id)
                .await
                .map_err(state_error)?;
            warn!(
                action_id = %action.id,
                target_id = %target_id,
                attempt,
                max_attempts = cfg.max_attempts,
                "retry rejected: max attempts exceeded"
            );
            return Err(HandlerError::MaxAttemptsExceeded {
                attempts: attempt,
                max_attempts: cfg.max_attempts,
            });
        }

        let now = Utc::now();
        if let Some(not_before) = state.not_before()
            && not_before > now
        {
            debug!(target_id = %target_id, %not_before, "retry backoff still running");
            return Ok(HandlerOutcome::waiting(
                not_before,
                format!("backoff for {} {target_id} has not elapsed", target_type.as_str()),
            ));
        }

        let backoff = ExponentialBackoff::from_config(cfg);
        let delay_ms = backoff.delay_ms(attempt);

        let outcome = match self.dispatch(action, target_type, &target_id).await {
            Ok(outcome) => outcome,
            Err(e @ HandlerError::TargetNotFound(_)) => return Err(e),
            Err(e) => TargetRetryResult {
                success: false,
                previous_status: String::new(),
                new_status: String::new(),
                error: Some(e.to_string()),
            },
        };

        if outcome.success {
            self.states
                .clear(org, &action.id, &target_id)
                .await
                .map_err(state_error)?;
            info!(
                action_id = %action.id,
                target_type = target_type.as_str(),
                target_id = %target_id,
                attempt,
                "target retried"
            );

            let rollback = RetryRollback {
                target_type,
                target_id: target_id.clone(),
                previous_status: outcome.previous_status.clone(),
            };
            let result = HandlerResult::new(serde_json::json!({
                "target_type": target_type.as_str(),
                "target_id": target_id,
                "attempt": attempt,
                "previous_status": outcome.previous_status,
                "new_status": outcome.new_status,
            }))
            .with_change(EntityChange::new(
                target_type.as_str(),
                target_id.clone(),
                "status",
                serde_json::Value::String(outcome.previous_status.clone()),
                serde_json::Value::String(outcome.new_status.clone()),
            ))
            .with_rollback_data(serde_json::to_value(&rollback)?);
            return Ok(HandlerOutcome::Completed(result));
        }

        let error = outcome
            .error
            .unwrap_or_else(|| format!("{} {target_id} retry failed", target_type.as_str()));
        state.attempt_count = attempt;
        state.last_attempt_at = Some(now);
        state.next_delay_ms = delay_ms;
        state.errors.push(error.clone());
        self.states.put(org, &state).await.map_err(state_error)?;

        if attempt >= cfg.max_attempts {
            warn!(
                action_id = %action.id,
                target_id = %target_id,
                attempt,
                error = %error,
                "retry failed; no attempts remain"
            );
            return Err(HandlerError::ExecutionFailed(format!(
                "attempt {attempt} of {} failed: {error}",
                cfg.max_attempts
            )));
        }

        let not_before = state.not_before().unwrap_or(now);
        debug!(
            target_id = %target_id,
            attempt,
            delay_ms,
            "retry failed; scheduling next attempt"
        );
        Ok(HandlerOutcome::deferred(
            not_before,
            format!("attempt {attempt} of {} failed: {error}", cfg.max_attempts),
        ))
    }

    fn can_rollback(&self) -> bool {
        true
    }

    async fn rollback(
        &self,
        action: &AutomatedAction,
        execution_id: &ExecutionId,
        rollback_data: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        let data: RetryRollback = serde_json::from_value(rollback_data.clone())?;
        self.targets
            .restore_status(
                &action.organization_id,
                data.target_type,
                &data.target_id,
                &data.previous_status,
            )
            .await
            .map_err(|e| HandlerError::RollbackFailed(e.to_string()))?;
        info!(
            execution_id = %execution_id,
            target_id = %data.target_id,
            status = %data.previous_status,
            "retry rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mender_core::{AffectedEntity, DetectedPattern, OrganizationId, Severity, TriggerContext};
    use mender_state_memory::MemoryRetryStore;

    use super::*;
    use crate::targets::MemoryRetryTargets;

    const ORG: &str = "acme";

    struct Fixture {
        handler: RetryHandler,
        targets: Arc<MemoryRetryTargets>,
        states: Arc<MemoryRetryStore>,
    }

    fn fixture() -> Fixture {
        let targets = Arc::new(MemoryRetryTargets::new());
        targets.insert(ORG, RetryTargetType::Job, "job-7", "failed");
        let states = Arc::new(MemoryRetryStore::new());
        Fixture {
            handler: RetryHandler::new(targets.clone(), states.clone()),
            targets,
            states,
        }
    }

    fn retry_action(max_attempts: u32) -> AutomatedAction {
        AutomatedAction::new(
            "retry-jobs",
            ORG,
            "retry failed jobs",
            ActionConfig::Retry(RetryConfig {
                target_type: Some(RetryTargetType::Job),
                max_attempts,
                delay_seconds: 10,
                backoff_multiplier: 2.0,
            }),
        )
    }

    fn execution_for(action: &AutomatedAction) -> ActionExecution {
        let pattern = DetectedPattern::new("stuck_workflow", "job keeps failing", Severity::Medium)
            .with_entity(AffectedEntity::new("job", "job-7", "nightly import", 1.0));
        ActionExecution::new(action, TriggerContext::new("detector").with_pattern(pattern))
    }

    async fn stored_state(f: &Fixture, action: &AutomatedAction) -> Option<RetryState> {
        f.states
            .get(&OrganizationId::new(ORG), &action.id, "job-7")
            .await
            .unwrap()
    }

    /// Pretend the backoff already elapsed.
    async fn expire_backoff(f: &Fixture, action: &AutomatedAction) {
        let mut state = stored_state(f, action).await.expect("state should exist");
        state.last_attempt_at = Some(Utc::now() - chrono::Duration::hours(2));
        f.states.put(&OrganizationId::new(ORG), &state).await.unwrap();
    }

    #[test]
    fn validate_bounds() {
        let f = fixture();
        let ok = retry_action(3);
        assert!(f.handler.validate(&ok.config).is_ok());

        for bad in [
            RetryConfig {
                target_type: None,
                ..RetryConfig::default()
            },
            RetryConfig {
                target_type: Some(RetryTargetType::Job),
                max_attempts: 0,
                ..RetryConfig::default()
            },
            RetryConfig {
                target_type: Some(RetryTargetType::Job),
                max_attempts: 11,
                ..RetryConfig::default()
            },
            RetryConfig {
                target_type: Some(RetryTargetType::Integration),
                delay_seconds: 0,
                ..RetryConfig::default()
            },
            RetryConfig {
                target_type: Some(RetryTargetType::ProcessStep),
                backoff_multiplier: 0.5,
                ..RetryConfig::default()
            },
        ] {
            assert!(
                matches!(
                    f.handler.validate(&ActionConfig::Retry(bad.clone())),
                    Err(HandlerError::InvalidConfig(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn success_clears_state_and_returns_rollback_data() {
        let f = fixture();
        let action = retry_action(3);
        let execution = execution_for(&action);

        let outcome = f.handler.execute(&action, &execution).await.unwrap();
        let HandlerOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].before, "failed");
        assert_eq!(result.changes[0].after, "pending");
        assert!(result.rollback_data.is_some());
        assert!(stored_state(&f, &action).await.is_none());
        assert_eq!(f.targets.retry_count(ORG, RetryTargetType::Job, "job-7"), 1);
    }

    #[tokio::test]
    async fn documented_backoff_schedule_then_max_attempts() {
        let f = fixture();
        f.targets.fail_next(ORG, RetryTargetType::Job, "job-7", 10);
        let action = retry_action(3);
        let execution = execution_for(&action);

        // Attempt 1 fails and waits 10s.
        let before = Utc::now();
        let outcome = f.handler.execute(&action, &execution).await.unwrap();
        let HandlerOutcome::Deferred {
            not_before,
            attempted: true,
            ..
        } = outcome
        else {
            panic!("expected deferral");
        };
        assert!(not_before >= before + chrono::Duration::seconds(10));
        let state = stored_state(&f, &action).await.unwrap();
        assert_eq!((state.attempt_count, state.next_delay_ms), (1, 10_000));

        // Running again before the delay elapses does not attempt.
        let outcome = f.handler.execute(&action, &execution).await.unwrap();
        assert!(matches!(
            outcome,
            HandlerOutcome::Deferred {
                attempted: false,
                ..
            }
        ));
        assert_eq!(f.targets.retry_count(ORG, RetryTargetType::Job, "job-7"), 1);

        // Attempt 2 fails and waits 20s.
        expire_backoff(&f, &action).await;
        f.handler.execute(&action, &execution).await.unwrap();
        let state = stored_state(&f, &action).await.unwrap();
        assert_eq!((state.attempt_count, state.next_delay_ms), (2, 20_000));

        // Attempt 3 fails with 40s recorded and no more scheduling.
        expire_backoff(&f, &action).await;
        let err = f.handler.execute(&action, &execution).await.unwrap_err();
        assert!(matches!(err, HandlerError::ExecutionFailed(_)));
        assert!(!err.is_retryable());
        let state = stored_state(&f, &action).await.unwrap();
        assert_eq!((state.attempt_count, state.next_delay_ms), (3, 40_000));
        assert_eq!(state.errors.len(), 3);

        // Attempt 4 is rejected outright and the counter stops increasing.
        let err = f.handler.execute(&action, &execution).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::MaxAttemptsExceeded {
                attempts: 4,
                max_attempts: 3
            }
        ));
        assert_eq!(f.targets.retry_count(ORG, RetryTargetType::Job, "job-7"), 3);
        assert!(stored_state(&f, &action).await.is_none(), "state discarded");
    }

    #[tokio::test]
    async fn missing_target_fails_without_state() {
        let f = fixture();
        let action = retry_action(3);
        let execution = ActionExecution::new(&action, TriggerContext::new("manual"));

        let err = f.handler.execute(&action, &execution).await.unwrap_err();
        assert!(matches!(err, HandlerError::TargetNotFound(_)));

        let unknown = ActionExecution::new(
            &action,
            TriggerContext::new("manual").with_target("job", "job-404"),
        );
        let err = f.handler.execute(&action, &unknown).await.unwrap_err();
        assert!(matches!(err, HandlerError::TargetNotFound(_)));
        assert!(
            f.states
                .get(&OrganizationId::new(ORG), &action.id, "job-404")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn rollback_restores_previous_status() {
        let f = fixture();
        let action = retry_action(3);
        let execution = execution_for(&action);
        let HandlerOutcome::Completed(result) = f.handler.execute(&action, &execution).await.unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(
            f.targets.status(ORG, RetryTargetType::Job, "job-7").as_deref(),
            Some("pending")
        );

        let data = result.rollback_data.unwrap();
        f.handler.rollback(&action, &execution.id, &data).await.unwrap();
        assert_eq!(
            f.targets.status(ORG, RetryTargetType::Job, "job-7").as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn rollback_with_garbage_data_fails() {
        let f = fixture();
        let action = retry_action(3);
        let err = f
            .handler
            .rollback(&action, &ExecutionId::new("e1"), &serde_json::json!({"nope": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Serialization(_)));
    }
}
