use std::sync::Arc;

use mender_audit::{AuditStore, HashChainAuditStore};
use mender_core::{ActionType, ApprovalPolicy};
use mender_handler::{
    ActorDirectory, DynHandler, HandlerRegistry, LogNotifier, Notifier, NotifyHandler,
    StaticActorDirectory,
};
use mender_retry::ExponentialBackoff;
use mender_state::{DistributedLock, StateStore};

use crate::approval::ApprovalWorkflow;
use crate::engine::RemediationEngine;
use crate::error::EngineError;
use crate::executor::ActionExecutor;
use crate::metrics::EngineMetrics;
use crate::records::Records;
use crate::trail::AuditTrail;

/// Fluent builder for a [`RemediationEngine`].
///
/// A [`StateStore`], a [`DistributedLock`] and an [`AuditStore`] are
/// required. Everything else has a default: a logging notifier, an empty
/// actor directory, the default approval policy, and hash-chained audit.
pub struct EngineBuilder {
    state: Option<Arc<dyn StateStore>>,
    lock: Option<Arc<dyn DistributedLock>>,
    audit: Option<Arc<dyn AuditStore>>,
    handlers: HandlerRegistry,
    notifier: Option<Arc<dyn Notifier>>,
    directory: Option<Arc<dyn ActorDirectory>>,
    policy: ApprovalPolicy,
    hash_chain: bool,
    default_max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            state: None,
            lock: None,
            audit: None,
            handlers: HandlerRegistry::new(),
            notifier: None,
            directory: None,
            policy: ApprovalPolicy::default(),
            hash_chain: true,
            default_max_attempts: 1,
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Set the store holding actions, executions, requests and claims.
    #[must_use]
    pub fn state(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = Some(store);
        self
    }

    /// Set the lock that leases periodic sweeps.
    #[must_use]
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    #[must_use]
    pub fn audit(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(store);
        self
    }

    /// Register an action handler. Replaces a handler of the same type.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn DynHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn directory(mut self, directory: Arc<dyn ActorDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Wrap the audit store in a [`HashChainAuditStore`] (default: on).
    #[must_use]
    pub fn hash_chain(mut self, enabled: bool) -> Self {
        self.hash_chain = enabled;
        self
    }

    /// Attempts given to actions registered with `max_attempts = 0`.
    #[must_use]
    pub fn default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    /// Backoff for retryable handler errors.
    #[must_use]
    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<RemediationEngine, EngineError> {
        let state = self
            .state
            .ok_or_else(|| EngineError::Configuration("state store is required".into()))?;
        let lock = self
            .lock
            .ok_or_else(|| EngineError::Configuration("distributed lock is required".into()))?;
        let audit_store = self
            .audit
            .ok_or_else(|| EngineError::Configuration("audit store is required".into()))?;

        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier::new()));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticActorDirectory::new()));

        let mut handlers = self.handlers;
        if handlers.get(ActionType::Notify).is_none() {
            handlers.register(Arc::new(NotifyHandler::new(Arc::clone(&notifier))));
        }

        let chain = self
            .hash_chain
            .then(|| Arc::new(HashChainAuditStore::new(Arc::clone(&audit_store))));
        let audit_store: Arc<dyn AuditStore> = match chain {
            Some(ref chain) => Arc::clone(chain) as Arc<dyn AuditStore>,
            None => audit_store,
        };

        let records = Records::new(state);
        let audit = AuditTrail::new(audit_store);
        let metrics = Arc::new(EngineMetrics::default());
        let executor = ActionExecutor::new(
            records.clone(),
            audit.clone(),
            Arc::new(handlers),
            Arc::clone(&notifier),
            Arc::clone(&metrics),
        )
        .with_backoff(self.backoff);
        let approvals = ApprovalWorkflow::new(
            records.clone(),
            audit.clone(),
            executor.clone(),
            directory,
            notifier,
            Arc::clone(&metrics),
        );

        Ok(RemediationEngine {
            records,
            audit,
            chain,
            executor,
            approvals,
            lock,
            policy: self.policy,
            metrics,
            default_max_attempts: self.default_max_attempts,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
