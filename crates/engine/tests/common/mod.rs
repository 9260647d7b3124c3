#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mender_audit::{AuditEntry, AuditError, AuditPage, AuditQuery, AuditStore};
use mender_audit_memory::MemoryAuditStore;
use mender_core::{
    ActionConfig, ActionExecution, ActionId, ActionType, ApprovalPolicy, AutomatedAction,
    ExecutionId, ExecutionQuery, NotifyConfig, OrganizationId, RetryConfig, RetryTargetType,
};
use mender_engine::{EngineBuilder, RemediationEngine};
use mender_handler::testing::RecordingNotifier;
use mender_handler::{
    ActionHandler, HandlerError, HandlerOutcome, HandlerResult, StaticActorDirectory,
};
use mender_redistribute::{MemoryWorkAssignments, RedistributeHandler};
use mender_retry::{ExponentialBackoff, MemoryRetryTargets, RetryHandler};
use mender_state::RetryStateStore;
use mender_state_memory::{MemoryDistributedLock, MemoryRetryStore, MemoryStateStore};

pub const ORG: &str = "acme";

pub fn org() -> OrganizationId {
    OrganizationId::new(ORG)
}

/// Handler that fails with a transient error a set number of times, then
/// completes with rollback data.
#[derive(Debug, Default)]
pub struct FlakyHandler {
    pub failures: AtomicU32,
    pub fail_rollback: AtomicBool,
    pub calls: AtomicU32,
    /// When set, the next `execute` takes the audit store down before returning.
    pub audit_down_on_execute: AtomicBool,
    audit_switch: OnceLock<Arc<AtomicBool>>,
}

impl FlakyHandler {
    pub fn failing(times: u32) -> Self {
        Self {
            failures: AtomicU32::new(times),
            ..Self::default()
        }
    }
}

impl ActionHandler for FlakyHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Notify
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), HandlerError> {
        match config {
            ActionConfig::Notify(cfg) if !cfg.title.is_empty() => Ok(()),
            _ => Err(HandlerError::InvalidConfig("title is required".into())),
        }
    }

    async fn execute(
        &self,
        _action: &AutomatedAction,
        execution: &ActionExecution,
    ) -> Result<HandlerOutcome, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.audit_down_on_execute.swap(false, Ordering::SeqCst)
            && let Some(switch) = self.audit_switch.get()
        {
            switch.store(true, Ordering::SeqCst);
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::Transient("upstream busy".into()));
        }
        Ok(HandlerOutcome::Completed(
            HandlerResult::new(serde_json::json!({ "ok": true }))
                .with_rollback_data(serde_json::json!({ "execution_id": execution.id })),
        ))
    }

    fn can_rollback(&self) -> bool {
        true
    }

    async fn rollback(
        &self,
        _action: &AutomatedAction,
        _execution_id: &ExecutionId,
        _rollback_data: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            Err(HandlerError::RollbackFailed("downstream refused".into()))
        } else {
            Ok(())
        }
    }
}

/// Audit store that can be switched into failing every write.
#[derive(Debug, Default)]
pub struct SwitchableAudit {
    pub inner: MemoryAuditStore,
    pub failing: Arc<AtomicBool>,
    countdown: AtomicBool,
    writes_left: AtomicU32,
}

impl SwitchableAudit {
    /// Accept `writes` more entries, then start failing.
    pub fn fail_after(&self, writes: u32) {
        self.writes_left.store(writes, Ordering::SeqCst);
        self.countdown.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.countdown.store(false, Ordering::SeqCst);
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditStore for SwitchableAudit {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if self.countdown.load(Ordering::SeqCst)
            && self
                .writes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            self.countdown.store(false, Ordering::SeqCst);
            self.failing.store(true, Ordering::SeqCst);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Storage("audit backend offline".into()));
        }
        self.inner.record(entry).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<AuditEntry>, AuditError> {
        self.inner.get_by_id(id).await
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        self.inner.query(query).await
    }
}

pub struct Harness {
    pub engine: Arc<RemediationEngine>,
    pub audit: Arc<SwitchableAudit>,
    pub notifier: Arc<RecordingNotifier>,
    pub lock: Arc<MemoryDistributedLock>,
    pub targets: Arc<MemoryRetryTargets>,
    pub retry_states: Arc<MemoryRetryStore>,
    pub work: Arc<MemoryWorkAssignments>,
    pub flaky: Arc<FlakyHandler>,
}

pub struct HarnessOptions {
    pub policy: ApprovalPolicy,
    pub flaky_failures: u32,
    pub hash_chain: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            policy: ApprovalPolicy::default(),
            flaky_failures: 0,
            hash_chain: false,
        }
    }
}

pub fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

pub fn harness_with(options: HarnessOptions) -> Harness {
    let audit = Arc::new(SwitchableAudit::default());
    let notifier = Arc::new(RecordingNotifier::new());
    let lock = Arc::new(MemoryDistributedLock::new());
    let targets = Arc::new(MemoryRetryTargets::new());
    let retry_states = Arc::new(MemoryRetryStore::new());
    let work = Arc::new(MemoryWorkAssignments::new());
    let flaky = Arc::new(FlakyHandler::failing(options.flaky_failures));
    let _ = flaky.audit_switch.set(Arc::clone(&audit.failing));

    let directory = StaticActorDirectory::new()
        .with_role(ORG, "admin", &["root"])
        .with_role(ORG, "manager", &["mia"])
        .with_role(ORG, "ops", &["oscar"]);

    let engine = EngineBuilder::new()
        .state(Arc::new(MemoryStateStore::new()))
        .lock(lock.clone())
        .audit(audit.clone())
        .notifier(notifier.clone())
        .directory(Arc::new(directory))
        .policy(options.policy)
        .hash_chain(options.hash_chain)
        .backoff(ExponentialBackoff::new(std::time::Duration::from_secs(1), 2.0))
        .handler(Arc::new(RetryHandler::new(targets.clone(), retry_states.clone())))
        .handler(Arc::new(RedistributeHandler::new(work.clone(), notifier.clone())))
        .handler(flaky.clone())
        .build()
        .unwrap();

    Harness {
        engine: Arc::new(engine),
        audit,
        notifier,
        lock,
        targets,
        retry_states,
        work,
        flaky,
    }
}

pub fn retry_action(id: &str, max_attempts: u32) -> AutomatedAction {
    AutomatedAction::new(
        id,
        ORG,
        "retry stuck step",
        ActionConfig::Retry(RetryConfig {
            target_type: Some(RetryTargetType::ProcessStep),
            max_attempts,
            delay_seconds: 10,
            backoff_multiplier: 2.0,
        }),
    )
}

pub fn flaky_action(id: &str) -> AutomatedAction {
    AutomatedAction::new(
        id,
        ORG,
        "ping upstream",
        ActionConfig::Notify(NotifyConfig {
            recipients: Vec::new(),
            notify_affected: false,
            title: "ping".into(),
            message: "ping".into(),
        }),
    )
}

impl Harness {
    /// Pretend the retry backoff for `target` started long ago.
    pub async fn rewind_backoff(&self, action_id: &str, target: &str) {
        let org = org();
        let action_id = ActionId::new(action_id);
        let mut state = self
            .retry_states
            .get(&org, &action_id, target)
            .await
            .unwrap()
            .expect("retry state exists");
        state.last_attempt_at = Some(Utc::now() - Duration::hours(2));
        self.retry_states.put(&org, &state).await.unwrap();
    }

    pub async fn execution(&self, id: &ExecutionId) -> ActionExecution {
        self.engine
            .get_execution(&org(), id)
            .await
            .unwrap()
            .expect("execution exists")
    }

    /// The single execution stored for the organization.
    pub async fn only_execution(&self) -> ActionExecution {
        let page = self
            .engine
            .list_executions(&org(), &ExecutionQuery::default())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1, "{:?}", page.items);
        page.items.into_iter().next().unwrap()
    }

    /// Audit event types for one execution, oldest first.
    pub async fn events(&self, id: &ExecutionId) -> Vec<String> {
        self.engine
            .audit_history(&org(), id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}
