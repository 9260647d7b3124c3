//! Persistence of actions, executions, approval requests and target claims
//! on top of a [`StateStore`].
//!
//! Every status change is a conditional update: the record is read with its
//! version, the guard is checked, and the write only lands if the version is
//! unchanged. On a lost race the guard is re-checked against the fresh value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mender_core::{
    ActionExecution, ActionId, ApprovalId, ApprovalQuery, ApprovalRequest, AutomatedAction,
    ExecutionId, ExecutionQuery, ExecutionStatus, OrganizationId, Page, retry_key,
};
use mender_state::{CasResult, KeyKind, StateError, StateKey, StateStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::error::EngineError;

const MAX_CAS_ATTEMPTS: usize = 8;

/// A committed conditional update.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub before: T,
    pub after: T,
    /// Version of the record holding `after`.
    pub version: u64,
}

/// Typed record access for the engine.
#[derive(Clone)]
pub struct Records {
    state: Arc<dyn StateStore>,
}

impl Records {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    fn execution_key(organization: &OrganizationId, id: &ExecutionId) -> StateKey {
        StateKey::new(organization.clone(), KeyKind::Execution, id.as_str())
    }

    fn approval_key(organization: &OrganizationId, id: &ApprovalId) -> StateKey {
        StateKey::new(organization.clone(), KeyKind::Approval, id.as_str())
    }

    fn action_key(organization: &OrganizationId, id: &ActionId) -> StateKey {
        StateKey::new(organization.clone(), KeyKind::Action, id.as_str())
    }

    fn claim_key(organization: &OrganizationId, action_id: &ActionId, target_id: &str) -> StateKey {
        StateKey::new(
            organization.clone(),
            KeyKind::ActiveTarget,
            retry_key(action_id, target_id),
        )
    }

    async fn insert<T: Serialize + Sync>(&self, key: &StateKey, value: &T) -> Result<(), EngineError> {
        let json = serde_json::to_string(value)?;
        match self.state.compare_and_swap(key, 0, &json, None).await? {
            CasResult::Ok => Ok(()),
            CasResult::Conflict {
                current_version, ..
            } => Err(EngineError::State(StateError::CasConflict {
                expected: 0,
                found: current_version,
            })),
        }
    }

    async fn load<T: DeserializeOwned>(&self, key: &StateKey) -> Result<Option<(T, u64)>, EngineError> {
        match self.state.get_versioned(key).await? {
            Some(v) => Ok(Some((serde_json::from_str(&v.value)?, v.version))),
            None => Ok(None),
        }
    }

    async fn update<T, F>(&self, key: &StateKey, mut apply: F) -> Result<Change<T>, EngineError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
        F: FnMut(&mut T) -> Result<(), EngineError> + Send,
    {
        let mut last_version = 0;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (before, version): (T, u64) = self
                .load(key)
                .await?
                .ok_or_else(|| EngineError::NotFound(key.to_string()))?;
            let mut after = before.clone();
            apply(&mut after)?;
            let json = serde_json::to_string(&after)?;
            match self.state.compare_and_swap(key, version, &json, None).await? {
                CasResult::Ok => {
                    return Ok(Change {
                        before,
                        after,
                        version: version + 1,
                    });
                }
                CasResult::Conflict {
                    current_version, ..
                } => last_version = current_version,
            }
        }
        Err(EngineError::State(StateError::CasConflict {
            expected: last_version,
            found: last_version + 1,
        }))
    }

    /// Put `change.before` back if nothing has written since `change`.
    async fn revert<T: Serialize + Sync>(&self, key: &StateKey, change: &Change<T>) {
        let restored = match serde_json::to_string(&change.before) {
            Ok(json) => json,
            Err(e) => {
                error!(key = %key, error = %e, "cannot serialize record for revert");
                return;
            }
        };
        match self
            .state
            .compare_and_swap(key, change.version, &restored, None)
            .await
        {
            Ok(CasResult::Ok) => {}
            Ok(CasResult::Conflict { .. }) => {
                error!(key = %key, "record changed before revert; leaving it in place");
            }
            Err(e) => error!(key = %key, error = %e, "revert failed"),
        }
    }

    async fn scan<T: DeserializeOwned>(
        &self,
        organization: &OrganizationId,
        kind: KeyKind,
    ) -> Result<Vec<T>, EngineError> {
        self.state
            .scan_keys(organization.as_str(), kind)
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_str(&value).map_err(EngineError::from))
            .collect()
    }

    // -- Actions --

    pub async fn put_action(&self, action: &AutomatedAction) -> Result<(), EngineError> {
        let key = Self::action_key(&action.organization_id, &action.id);
        self.state
            .set(&key, &serde_json::to_string(action)?, None)
            .await?;
        Ok(())
    }

    pub async fn get_action(
        &self,
        organization: &OrganizationId,
        id: &ActionId,
    ) -> Result<Option<AutomatedAction>, EngineError> {
        Ok(self
            .load(&Self::action_key(organization, id))
            .await?
            .map(|(action, _)| action))
    }

    /// Every action in the organization, sorted by id.
    pub async fn list_actions(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<AutomatedAction>, EngineError> {
        let mut actions: Vec<AutomatedAction> = self.scan(organization, KeyKind::Action).await?;
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(actions)
    }

    // -- Executions --

    pub async fn insert_execution(&self, execution: &ActionExecution) -> Result<(), EngineError> {
        self.insert(
            &Self::execution_key(&execution.organization_id, &execution.id),
            execution,
        )
        .await
    }

    /// Remove an execution whose creation could not be audited.
    pub async fn discard_execution(&self, execution: &ActionExecution) -> Result<bool, EngineError> {
        Ok(self
            .state
            .delete(&Self::execution_key(&execution.organization_id, &execution.id))
            .await?)
    }

    pub async fn get_execution(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
    ) -> Result<Option<ActionExecution>, EngineError> {
        Ok(self
            .load(&Self::execution_key(organization, id))
            .await?
            .map(|(execution, _)| execution))
    }

    /// Move an execution to `to` if the state machine allows it from the
    /// current status and, when `from` is non-empty, the current status is
    /// one of `from`.
    pub async fn transition_execution<F>(
        &self,
        organization: &OrganizationId,
        id: &ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        mut mutate: F,
    ) -> Result<Change<ActionExecution>, EngineError>
    where
        F: FnMut(&mut ActionExecution) + Send,
    {
        self.update(&Self::execution_key(organization, id), |execution: &mut ActionExecution| {
            let current = execution.status;
            if !(from.is_empty() || from.contains(&current)) || !current.can_transition_to(to) {
                return Err(EngineError::InvalidTransition {
                    id: execution.id.clone(),
                    from: current,
                    to,
                });
            }
            execution.status = to;
            execution.updated_at = Utc::now();
            mutate(execution);
            Ok(())
        })
        .await
    }

    pub async fn revert_execution(&self, change: &Change<ActionExecution>) {
        let key = Self::execution_key(&change.after.organization_id, &change.after.id);
        self.revert(&key, change).await;
    }

    /// Executions matching `query`, newest first.
    pub async fn list_executions(
        &self,
        organization: &OrganizationId,
        query: &ExecutionQuery,
    ) -> Result<Page<ActionExecution>, EngineError> {
        let mut matching: Vec<ActionExecution> = self
            .scan::<ActionExecution>(organization, KeyKind::Execution)
            .await?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(Page::from_sorted(matching, query.limit, query.offset))
    }

    /// `Scheduled` executions due at or before `now`, earliest first.
    pub async fn due_executions(
        &self,
        organization: &OrganizationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionExecution>, EngineError> {
        let query = ExecutionQuery {
            statuses: vec![ExecutionStatus::Scheduled],
            due_before: Some(now),
            ..ExecutionQuery::default()
        };
        let mut due: Vec<ActionExecution> = self
            .scan::<ActionExecution>(organization, KeyKind::Execution)
            .await?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);
        Ok(due)
    }

    // -- Approval requests --

    pub async fn insert_approval(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
        self.insert(
            &Self::approval_key(&request.organization_id, &request.id),
            request,
        )
        .await
    }

    pub async fn discard_approval(&self, request: &ApprovalRequest) -> Result<bool, EngineError> {
        Ok(self
            .state
            .delete(&Self::approval_key(&request.organization_id, &request.id))
            .await?)
    }

    pub async fn get_approval(
        &self,
        organization: &OrganizationId,
        id: &ApprovalId,
    ) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self
            .load(&Self::approval_key(organization, id))
            .await?
            .map(|(request, _)| request))
    }

    pub async fn update_approval<F>(
        &self,
        organization: &OrganizationId,
        id: &ApprovalId,
        apply: F,
    ) -> Result<Change<ApprovalRequest>, EngineError>
    where
        F: FnMut(&mut ApprovalRequest) -> Result<(), EngineError> + Send,
    {
        self.update(&Self::approval_key(organization, id), apply).await
    }

    pub async fn revert_approval(&self, change: &Change<ApprovalRequest>) {
        let key = Self::approval_key(&change.after.organization_id, &change.after.id);
        self.revert(&key, change).await;
    }

    /// Every request matching `query`, oldest first, without pagination.
    pub async fn find_approvals(
        &self,
        organization: &OrganizationId,
        query: &ApprovalQuery,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        let mut matching: Vec<ApprovalRequest> = self
            .scan::<ApprovalRequest>(organization, KeyKind::Approval)
            .await?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    /// Requests matching `query`, newest first.
    pub async fn list_approvals(
        &self,
        organization: &OrganizationId,
        query: &ApprovalQuery,
    ) -> Result<Page<ApprovalRequest>, EngineError> {
        let mut matching = self.find_approvals(organization, query).await?;
        matching.reverse();
        Ok(Page::from_sorted(matching, query.limit, query.offset))
    }

    // -- Target claims --

    /// Claim `(action, target)` for `execution_id`. `false` if already held.
    pub async fn claim_target(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
        execution_id: &ExecutionId,
    ) -> Result<bool, EngineError> {
        Ok(self
            .state
            .check_and_set(
                &Self::claim_key(organization, action_id, target_id),
                execution_id.as_str(),
                None,
            )
            .await?)
    }

    /// Release the claim if `execution_id` still holds it.
    pub async fn release_target(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
        execution_id: &ExecutionId,
    ) -> Result<bool, EngineError> {
        let key = Self::claim_key(organization, action_id, target_id);
        match self.state.get(&key).await? {
            Some(holder) if holder == execution_id.as_str() => Ok(self.state.delete(&key).await?),
            _ => Ok(false),
        }
    }

    /// The execution currently holding `(action, target)`, if any.
    pub async fn target_holder(
        &self,
        organization: &OrganizationId,
        action_id: &ActionId,
        target_id: &str,
    ) -> Result<Option<ExecutionId>, EngineError> {
        Ok(self
            .state
            .get(&Self::claim_key(organization, action_id, target_id))
            .await?
            .map(ExecutionId::new))
    }
}

#[cfg(test)]
mod tests {
    use mender_core::{ActionConfig, RetryConfig, RetryTargetType, TriggerContext};
    use mender_state_memory::MemoryStateStore;

    use super::*;

    fn records() -> Records {
        Records::new(Arc::new(MemoryStateStore::new()))
    }

    fn execution() -> (AutomatedAction, ActionExecution) {
        let action = AutomatedAction::new(
            "retry-steps",
            "acme",
            "retry steps",
            ActionConfig::Retry(RetryConfig {
                target_type: Some(RetryTargetType::ProcessStep),
                ..RetryConfig::default()
            }),
        );
        let execution =
            ActionExecution::new(&action, TriggerContext::new("test").with_target("process_step", "s1"));
        (action, execution)
    }

    #[tokio::test]
    async fn transition_checks_state_machine() {
        let records = records();
        let (_, execution) = execution();
        records.insert_execution(&execution).await.unwrap();
        let org = execution.organization_id.clone();

        let change = records
            .transition_execution(&org, &execution.id, &[], ExecutionStatus::Ready, |_| {})
            .await
            .unwrap();
        assert_eq!(change.before.status, ExecutionStatus::Created);
        assert_eq!(change.after.status, ExecutionStatus::Ready);

        let err = records
            .transition_execution(&org, &execution.id, &[], ExecutionStatus::Completed, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn from_list_narrows_allowed_sources() {
        let records = records();
        let (_, execution) = execution();
        records.insert_execution(&execution).await.unwrap();
        let org = execution.organization_id.clone();

        // Created -> Cancelled is a valid edge, but not from the listed states.
        let err = records
            .transition_execution(
                &org,
                &execution.id,
                &[ExecutionStatus::AwaitingApproval, ExecutionStatus::Scheduled],
                ExecutionStatus::Cancelled,
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn concurrent_terminal_transitions_apply_once() {
        let records = records();
        let (_, execution) = execution();
        records.insert_execution(&execution).await.unwrap();
        let org = execution.organization_id.clone();
        for to in [ExecutionStatus::Ready, ExecutionStatus::Executing] {
            records
                .transition_execution(&org, &execution.id, &[], to, |_| {})
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            records.transition_execution(&org, &execution.id, &[], ExecutionStatus::Completed, |_| {}),
            records.transition_execution(&org, &execution.id, &[], ExecutionStatus::Failed, |_| {}),
        );
        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    }

    #[tokio::test]
    async fn revert_restores_previous_record() {
        let records = records();
        let (_, execution) = execution();
        records.insert_execution(&execution).await.unwrap();
        let org = execution.organization_id.clone();

        let change = records
            .transition_execution(&org, &execution.id, &[], ExecutionStatus::Ready, |_| {})
            .await
            .unwrap();
        records.revert_execution(&change).await;
        let back = records.get_execution(&org, &execution.id).await.unwrap().unwrap();
        assert_eq!(back.status, ExecutionStatus::Created);
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_owner_released() {
        let records = records();
        let org = OrganizationId::new("acme");
        let action = ActionId::new("a1");
        let first = ExecutionId::new("e1");
        let second = ExecutionId::new("e2");

        assert!(records.claim_target(&org, &action, "t1", &first).await.unwrap());
        assert!(!records.claim_target(&org, &action, "t1", &second).await.unwrap());
        assert!(records.claim_target(&org, &action, "t2", &second).await.unwrap());

        assert!(!records.release_target(&org, &action, "t1", &second).await.unwrap());
        assert!(records.release_target(&org, &action, "t1", &first).await.unwrap());
        assert!(records.claim_target(&org, &action, "t1", &second).await.unwrap());
        assert_eq!(
            records.target_holder(&org, &action, "t1").await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn listing_is_scoped_and_paginated() {
        let records = records();
        let (action, _) = execution();
        for i in 0..5 {
            let execution = ActionExecution::new(
                &action,
                TriggerContext::new("test").with_target("process_step", format!("s{i}")),
            );
            records.insert_execution(&execution).await.unwrap();
        }
        let other = AutomatedAction::new("x", "globex", "x", ActionConfig::Retry(RetryConfig::default()));
        records
            .insert_execution(&ActionExecution::new(&other, TriggerContext::new("t")))
            .await
            .unwrap();

        let page = records
            .list_executions(
                &OrganizationId::new("acme"),
                &ExecutionQuery {
                    limit: Some(2),
                    ..ExecutionQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
    }
}
