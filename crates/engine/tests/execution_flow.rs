mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use mender_audit::{AuditQuery, AuditStore};
use mender_core::{
    ActionConfig, ActionId, ActionType, ActorId, AssignmentStrategy, AutomatedAction, ExecutionId,
    ExecutionQuery, ExecutionStatus, NotificationKind, OrganizationId, RedistributeConfig,
    RetryConfig, RetryTargetType, TargetPool, TeamMember, TriggerContext, WorkItem, WorkPriority,
};
use mender_engine::EngineError;
use mender_retry::RETRIED_STATUS;
use mender_state::RetryStateStore;

use common::{HarnessOptions, ORG, flaky_action, harness, harness_with, org, retry_action};

fn step_trigger(step: &str) -> TriggerContext {
    TriggerContext::new("stuck_process_step")
        .with_target(RetryTargetType::ProcessStep.as_str(), step)
        .with_triggered_by("rita")
}

#[tokio::test]
async fn invalid_config_is_rejected_before_anything_is_stored() {
    let h = harness();
    let action = AutomatedAction::new(
        "bad-retry",
        ORG,
        "broken",
        ActionConfig::Retry(RetryConfig {
            target_type: None,
            ..RetryConfig::default()
        }),
    );

    let err = h.engine.register_action(action).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
    assert!(h.audit.inner.is_empty());
    assert!(h.engine.list_actions(&org()).await.unwrap().is_empty());
}

#[tokio::test]
async fn config_of_the_wrong_type_is_a_validation_error() {
    let h = harness();
    let mut action = retry_action("mismatch", 3);
    action.action_type = ActionType::Notify;

    let err = h.engine.register_action(action).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_action_is_not_found() {
    let h = harness();
    let err = h
        .engine
        .trigger(&org(), &ActionId::new("ghost"), TriggerContext::new("manual"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn history_follows_the_lifecycle_in_order() {
    let h = harness_with(HarnessOptions {
        hash_chain: true,
        ..HarnessOptions::default()
    });
    h.engine.register_action(flaky_action("ping")).await.unwrap();

    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.metrics.attempts, 1);
    assert!(exec.completed_at.is_some());

    assert_eq!(
        h.events(&exec.id).await,
        vec![
            "execution.created",
            "execution.ready",
            "execution.started",
            "execution.completed"
        ]
    );

    let verification = h.engine.verify_audit_chain(&org()).await.unwrap();
    assert!(verification.valid);
    assert!(verification.entries_checked >= 5);
}

#[tokio::test]
async fn chain_verification_needs_the_chain_enabled() {
    let h = harness();
    let err = h.engine.verify_audit_chain(&org()).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

#[tokio::test]
async fn terminal_executions_cannot_be_approved_or_cancelled() {
    let h = harness();
    h.engine.register_action(flaky_action("ping")).await.unwrap();
    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
        .await
        .unwrap();

    let actor = ActorId::new("root");
    let err = h.engine.approve_execution(&org(), &exec.id, &actor).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }), "got {err:?}");
    let err = h.engine.cancel_execution(&org(), &exec.id, &actor).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }), "got {err:?}");
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn retry_backoff_doubles_until_attempts_run_out() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.targets.fail_next(ORG, RetryTargetType::ProcessStep, "step-1", 5);
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();
    let action_id = ActionId::new("retry-step");

    let exec = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Scheduled);
    let state = h.retry_states.get(&org(), &action_id, "step-1").await.unwrap().unwrap();
    assert_eq!(state.attempt_count, 1);
    assert_eq!(state.next_delay_ms, 10_000);

    h.rewind_backoff("retry-step", "step-1").await;
    let ran = h
        .engine
        .run_due_retries_at(&org(), Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(ran, 1);
    let state = h.retry_states.get(&org(), &action_id, "step-1").await.unwrap().unwrap();
    assert_eq!(state.attempt_count, 2);
    assert_eq!(state.next_delay_ms, 20_000);
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::Scheduled);

    h.rewind_backoff("retry-step", "step-1").await;
    h.engine
        .run_due_retries_at(&org(), Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    let state = h.retry_states.get(&org(), &action_id, "step-1").await.unwrap().unwrap();
    assert_eq!(state.attempt_count, 3);
    assert_eq!(state.next_delay_ms, 40_000);
    let failed = h.execution(&exec.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.metrics.attempts, 3);
    assert_eq!(h.notifier.of_kind(NotificationKind::ExecutionFailed).len(), 1);

    // The per-target budget is spent: the next trigger fails at once and resets it.
    let again = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Failed);
    assert!(again.error_message.unwrap().contains("max attempts exceeded"));
    assert!(h.retry_states.get(&org(), &action_id, "step-1").await.unwrap().is_none());
}

#[tokio::test]
async fn scheduled_execution_blocks_a_second_trigger_until_cancelled() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.targets.fail_next(ORG, RetryTargetType::ProcessStep, "step-1", 1);
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();
    let action_id = ActionId::new("retry-step");

    let first = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Scheduled);

    let err = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }), "got {err:?}");
    assert_eq!(h.engine.metrics().conflicts, 1);

    // A different target is independent.
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-2", "failed");
    let other = h.engine.trigger(&org(), &action_id, step_trigger("step-2")).await.unwrap();
    assert_eq!(other.status, ExecutionStatus::Completed);

    let cancelled = h
        .engine
        .cancel_execution(&org(), &first.id, &ActorId::new("oscar"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
    assert!(cancelled.next_attempt_at.is_none());

    h.rewind_backoff("retry-step", "step-1").await;
    let retried = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Completed);
    assert_eq!(
        h.targets.status(ORG, RetryTargetType::ProcessStep, "step-1").as_deref(),
        Some(RETRIED_STATUS)
    );
}

#[tokio::test]
async fn rollback_restores_the_retried_target_once() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();

    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("retry-step"), step_trigger("step-1"))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.changes.len(), 1);
    assert!(exec.rollback_data.is_some());

    let actor = ActorId::new("oscar");
    assert!(h.engine.rollback(&org(), &exec.id, &actor).await.unwrap());
    assert_eq!(
        h.targets.status(ORG, RetryTargetType::ProcessStep, "step-1").as_deref(),
        Some("failed")
    );
    let rolled = h.execution(&exec.id).await;
    assert_eq!(rolled.status, ExecutionStatus::RolledBack);
    assert_eq!(rolled.rolled_back_by, Some(actor.clone()));

    assert!(!h.engine.rollback(&org(), &exec.id, &actor).await.unwrap());
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::RolledBack);
}

#[tokio::test]
async fn rollback_of_an_unfinished_execution_is_refused() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.targets.fail_next(ORG, RetryTargetType::ProcessStep, "step-1", 1);
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();
    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("retry-step"), step_trigger("step-1"))
        .await
        .unwrap();

    assert!(!h.engine.rollback(&org(), &exec.id, &ActorId::new("oscar")).await.unwrap());
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::Scheduled);

    let missing = ExecutionId::new("nope");
    let err = h.engine.rollback(&org(), &missing, &ActorId::new("oscar")).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn failed_rollback_is_recorded_and_reported() {
    let h = harness();
    h.flaky.fail_rollback.store(true, Ordering::SeqCst);
    h.engine.register_action(flaky_action("ping")).await.unwrap();
    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
        .await
        .unwrap();

    let actor = ActorId::new("oscar");
    assert!(!h.engine.rollback(&org(), &exec.id, &actor).await.unwrap());

    let failed = h.execution(&exec.id).await;
    assert_eq!(failed.status, ExecutionStatus::RollbackFailed);
    assert!(failed.rollback_error.unwrap().contains("downstream refused"));
    let notes = h.notifier.of_kind(NotificationKind::RollbackFailed);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].recipient_id, actor);
    assert_eq!(h.engine.metrics().rollback_failed, 1);
}

#[tokio::test]
async fn transient_handler_errors_are_retried_up_to_the_action_limit() {
    let h = harness_with(HarnessOptions {
        flaky_failures: 2,
        ..HarnessOptions::default()
    });
    h.engine
        .register_action(flaky_action("ping").with_max_attempts(3))
        .await
        .unwrap();

    let exec = h
        .engine
        .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Scheduled);
    assert!(exec.error_message.unwrap().contains("upstream busy"));

    let later = Utc::now() + Duration::hours(2);
    assert_eq!(h.engine.run_due_retries_at(&org(), later).await.unwrap(), 1);
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::Scheduled);
    assert_eq!(h.engine.run_due_retries_at(&org(), later).await.unwrap(), 1);

    let done = h.execution(&exec.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.metrics.attempts, 3);
    assert_eq!(h.flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.engine.run_due_retries_at(&org(), later).await.unwrap(), 0);
}

#[tokio::test]
async fn transient_errors_fail_when_no_attempts_remain() {
    let h = harness_with(HarnessOptions {
        flaky_failures: 1,
        ..HarnessOptions::default()
    });
    h.engine.register_action(flaky_action("ping")).await.unwrap();

    let exec = h
        .engine
        .trigger(
            &org(),
            &ActionId::new("ping"),
            TriggerContext::new("manual").with_triggered_by("rita"),
        )
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    let notes = h.notifier.of_kind(NotificationKind::ExecutionFailed);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].recipient_id.as_str(), "rita");
}

#[tokio::test]
async fn redistribution_runs_and_rolls_back_through_the_engine() {
    let h = harness();
    h.work.add_member(ORG, TeamMember::new("dana", "Dana", 95.0), Some("platform"), None);
    h.work.add_member(ORG, TeamMember::new("eli", "Eli", 40.0), Some("platform"), None);
    h.work.add_member(ORG, TeamMember::new("fay", "Fay", 20.0), Some("platform"), None);
    for i in 0..3 {
        h.work.add_item(ORG, WorkItem::new(format!("w{i}"), "task", "dana", WorkPriority::Normal));
    }
    let action = AutomatedAction::new(
        "relieve",
        ORG,
        "relieve overload",
        ActionConfig::Redistribute(RedistributeConfig {
            target_pool: TargetPool::Team {
                team_id: "platform".into(),
            },
            strategy: AssignmentStrategy::LeastLoaded,
            max_items: 10,
            exclude_actor_ids: Vec::new(),
            source_actor_id: None,
            notify: true,
            record_history: true,
        }),
    );
    h.engine.register_action(action).await.unwrap();

    let exec = h
        .engine
        .trigger(
            &org(),
            &ActionId::new("relieve"),
            TriggerContext::new("overloaded_worker").with_target("user", "dana"),
        )
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.target_id.as_deref(), Some("dana"));
    assert_eq!(exec.metrics.changes_applied, 3);
    for i in 0..3 {
        assert_ne!(h.work.owner_of(ORG, &format!("w{i}")).unwrap().as_str(), "dana");
    }

    assert!(h.engine.rollback(&org(), &exec.id, &ActorId::new("oscar")).await.unwrap());
    for i in 0..3 {
        assert_eq!(h.work.owner_of(ORG, &format!("w{i}")).unwrap().as_str(), "dana");
    }
}

#[tokio::test]
async fn missing_target_is_rejected_with_a_warning_entry() {
    let h = harness();
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();

    let err = h
        .engine
        .trigger(&org(), &ActionId::new("retry-step"), TriggerContext::new("manual"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TargetResolution(_)), "got {err:?}");

    let page = h
        .engine
        .list_executions(&org(), &ExecutionQuery::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    let entries = h
        .audit
        .query(&AuditQuery {
            event_type: Some("execution.target_unresolved".into()),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.entries.len(), 1);
}

#[tokio::test]
async fn audit_outage_aborts_the_trigger_and_frees_the_target() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();
    let action_id = ActionId::new("retry-step");

    h.audit.failing.store(true, Ordering::SeqCst);
    let err = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)), "got {err:?}");
    let page = h
        .engine
        .list_executions(&org(), &ExecutionQuery::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(
        h.targets.status(ORG, RetryTargetType::ProcessStep, "step-1").as_deref(),
        Some("failed")
    );

    h.audit.failing.store(false, Ordering::SeqCst);
    let exec = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn audit_outage_after_the_handler_ran_keeps_the_outcome_and_frees_the_target() {
    let h = harness_with(HarnessOptions {
        hash_chain: true,
        ..HarnessOptions::default()
    });
    h.engine.register_action(flaky_action("ping")).await.unwrap();
    let action_id = ActionId::new("ping");
    let on_service = || TriggerContext::new("manual").with_target("service", "svc-1");

    h.flaky.audit_down_on_execute.store(true, Ordering::SeqCst);
    let err = h.engine.trigger(&org(), &action_id, on_service()).await.unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)), "got {err:?}");
    let first = h.only_execution().await;
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.target_id.as_deref(), Some("svc-1"));
    assert_eq!(h.flaky.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.audit_backlog_len(), 1);
    assert_eq!(h.engine.metrics().audit_deferred, 1);
    assert_eq!(
        h.events(&first.id).await,
        vec!["execution.created", "execution.ready", "execution.started"]
    );

    // The claim is free; only the audit store stands in the way.
    let err = h.engine.trigger(&org(), &action_id, on_service()).await.unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)), "got {err:?}");

    h.audit.recover();
    let second = h.engine.trigger(&org(), &action_id, on_service()).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(h.engine.audit_backlog_len(), 0);
    assert_eq!(
        h.events(&first.id).await,
        vec![
            "execution.created",
            "execution.ready",
            "execution.started",
            "execution.completed"
        ]
    );
    assert!(h.engine.verify_audit_chain(&org()).await.unwrap().valid);
}

#[tokio::test]
async fn deferred_audit_of_a_scheduled_retry_is_flushed_by_the_retry_sweep() {
    let h = harness_with(HarnessOptions {
        flaky_failures: 1,
        ..HarnessOptions::default()
    });
    h.engine
        .register_action(flaky_action("ping").with_max_attempts(2))
        .await
        .unwrap();

    h.flaky.audit_down_on_execute.store(true, Ordering::SeqCst);
    let err = h
        .engine
        .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Audit(_)), "got {err:?}");
    let exec = h.only_execution().await;
    assert_eq!(exec.status, ExecutionStatus::Scheduled);
    assert_eq!(h.engine.audit_backlog_len(), 1);

    h.audit.recover();
    let later = Utc::now() + Duration::hours(2);
    assert_eq!(h.engine.run_due_retries_at(&org(), later).await.unwrap(), 1);
    assert_eq!(h.engine.audit_backlog_len(), 0);
    assert_eq!(h.execution(&exec.id).await.status, ExecutionStatus::Completed);
    let events = h.events(&exec.id).await;
    assert_eq!(
        events.iter().filter(|e| *e == "execution.scheduled").count(),
        1,
        "{events:?}"
    );
    assert_eq!(events.last().map(String::as_str), Some("execution.completed"));
}

#[tokio::test]
async fn runs_inside_an_open_backoff_window_are_not_attempts() {
    let h = harness();
    h.targets.insert(ORG, RetryTargetType::ProcessStep, "step-1", "failed");
    h.targets.fail_next(ORG, RetryTargetType::ProcessStep, "step-1", 1);
    h.engine.register_action(retry_action("retry-step", 3)).await.unwrap();
    let action_id = ActionId::new("retry-step");

    let exec = h.engine.trigger(&org(), &action_id, step_trigger("step-1")).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Scheduled);
    assert_eq!(exec.metrics.attempts, 1);

    // Due by the execution's clock, but the retry backoff has not elapsed.
    let ran = h
        .engine
        .run_due_retries_at(&org(), Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(ran, 1);
    let waiting = h.execution(&exec.id).await;
    assert_eq!(waiting.status, ExecutionStatus::Scheduled);
    assert_eq!(waiting.metrics.attempts, 1);
    let state = h.retry_states.get(&org(), &action_id, "step-1").await.unwrap().unwrap();
    assert_eq!(state.attempt_count, 1);

    h.rewind_backoff("retry-step", "step-1").await;
    h.engine
        .run_due_retries_at(&org(), Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    let done = h.execution(&exec.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.metrics.attempts, 2);
}

#[tokio::test]
async fn executions_are_listed_newest_first_with_filters() {
    let h = harness();
    h.engine.register_action(flaky_action("ping")).await.unwrap();
    for _ in 0..3 {
        h.engine
            .trigger(&org(), &ActionId::new("ping"), TriggerContext::new("manual"))
            .await
            .unwrap();
    }

    let page = h
        .engine
        .list_executions(
            &org(),
            &ExecutionQuery {
                statuses: vec![ExecutionStatus::Completed],
                limit: Some(2),
                ..ExecutionQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert!(page.items[0].created_at >= page.items[1].created_at);

    let other_org = OrganizationId::new("globex");
    let empty = h
        .engine
        .list_executions(&other_org, &ExecutionQuery::default())
        .await
        .unwrap();
    assert_eq!(empty.total, 0);
}
