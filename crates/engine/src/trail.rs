//! Audit entry construction for executions and approval requests.

use std::collections::VecDeque;
use std::sync::Arc;

use mender_audit::{AuditEntry, AuditError, AuditQuery, AuditStore};
use mender_core::{ActionExecution, ApprovalRequest};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub const EXECUTION_ENTITY: &str = "action_execution";
pub const APPROVAL_ENTITY: &str = "approval_request";

const HISTORY_PAGE_SIZE: u32 = 1000;

/// Merge `extra` object fields into `base`. Non-object `extra` is ignored.
fn merge(mut base: Map<String, Value>, extra: Value) -> Value {
    if let Value::Object(fields) = extra {
        base.extend(fields);
    }
    Value::Object(base)
}

/// An entry about `execution` carrying its identifying fields plus `extra`.
pub fn execution_entry(
    execution: &ActionExecution,
    event_type: &str,
    description: impl Into<String>,
    extra: Value,
) -> AuditEntry {
    let mut base = Map::new();
    base.insert("action_id".into(), json!(execution.action_id));
    base.insert("action_type".into(), json!(execution.action_type));
    base.insert("status".into(), json!(execution.status));
    base.insert("target_id".into(), json!(execution.target_id));
    base.insert("attempts".into(), json!(execution.metrics.attempts));
    AuditEntry::new(
        execution.organization_id.as_str(),
        event_type,
        EXECUTION_ENTITY,
        execution.id.as_str(),
        description,
    )
    .with_details(merge(base, extra))
}

pub fn approval_entry(
    request: &ApprovalRequest,
    event_type: &str,
    description: impl Into<String>,
    extra: Value,
) -> AuditEntry {
    let mut base = Map::new();
    base.insert("execution_id".into(), json!(request.execution_id));
    base.insert("action_id".into(), json!(request.action_id));
    base.insert("status".into(), json!(request.status));
    base.insert("priority".into(), json!(request.priority));
    AuditEntry::new(
        request.organization_id.as_str(),
        event_type,
        APPROVAL_ENTITY,
        request.id.as_str(),
        description,
    )
    .with_details(merge(base, extra))
}

/// Handle over the audit store shared by the executor and the approval
/// workflow.
///
/// Entries describing state that is already committed and cannot be undone
/// go through [`record_or_defer`](Self::record_or_defer). When the store is
/// down they wait in a process-local backlog and are written, oldest first,
/// ahead of the next entry or on [`flush`](Self::flush).
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    backlog: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Write `entry`, after any backlog. Fails if either write fails.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.flush().await?;
        self.store.record(entry).await
    }

    /// Write `entry`, or queue it in the backlog when the store refuses it.
    ///
    /// The store's error is still returned so the caller can log it.
    pub async fn record_or_defer(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let queued = entry.clone();
        match self.record(entry).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut backlog = self.backlog.lock();
                backlog.push_back(queued);
                warn!(backlog = backlog.len(), error = %e, "audit entry deferred");
                Err(e)
            }
        }
    }

    /// Write every backlogged entry in order. Stops at the first failure,
    /// leaving that entry at the head of the backlog. Returns how many were
    /// written.
    pub async fn flush(&self) -> Result<usize, AuditError> {
        let mut written = 0;
        loop {
            let Some(entry) = self.backlog.lock().pop_front() else {
                break;
            };
            let retry = entry.clone();
            if let Err(e) = self.store.record(entry).await {
                self.backlog.lock().push_front(retry);
                return Err(e);
            }
            written += 1;
        }
        if written > 0 {
            info!(written, "audit backlog flushed");
        }
        Ok(written)
    }

    /// Entries waiting for the store to accept them.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Every entry for one entity, oldest first. Reads the store page by page.
    pub async fn history(
        &self,
        organization_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut entries = Vec::new();
        let mut offset = 0u32;
        loop {
            let query = AuditQuery {
                organization_id: Some(organization_id.to_owned()),
                limit: Some(HISTORY_PAGE_SIZE),
                offset: Some(offset),
                ..AuditQuery::for_entity(entity_type, entity_id)
            };
            let page = self.store.query(&query).await?;
            let fetched = page.entries.len();
            entries.extend(page.entries);
            if fetched < HISTORY_PAGE_SIZE as usize {
                break;
            }
            offset = offset.saturating_add(HISTORY_PAGE_SIZE);
        }
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.sequence_number.cmp(&b.sequence_number))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use mender_audit_memory::MemoryAuditStore;
    use mender_core::{ActionConfig, AutomatedAction, RetryConfig, TriggerContext};

    use super::*;

    #[tokio::test]
    async fn history_reads_past_a_single_page() {
        let store = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(Arc::clone(&store) as Arc<dyn AuditStore>);
        for i in 0..1203 {
            let entry =
                AuditEntry::new("acme", "execution.scheduled", EXECUTION_ENTITY, "x1", format!("{i}"));
            trail.record(entry).await.unwrap();
        }
        trail
            .record(AuditEntry::new("acme", "execution.created", EXECUTION_ENTITY, "x2", "other"))
            .await
            .unwrap();

        let history = trail.history("acme", EXECUTION_ENTITY, "x1").await.unwrap();
        assert_eq!(history.len(), 1203);
        assert!(history.iter().all(|e| e.entity_id == "x1"));
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn execution_entry_merges_extra_details() {
        let action = AutomatedAction::new("a1", "acme", "retry", ActionConfig::Retry(RetryConfig::default()));
        let execution =
            ActionExecution::new(&action, TriggerContext::new("manual").with_target("job", "j1"));
        let entry = execution_entry(
            &execution,
            "execution.created",
            "created",
            json!({"trigger_reason": "manual"}),
        );
        assert_eq!(entry.entity_type, EXECUTION_ENTITY);
        assert_eq!(entry.entity_id, execution.id.as_str());
        assert_eq!(entry.organization_id, "acme");
        assert_eq!(entry.details["target_id"], "j1");
        assert_eq!(entry.details["trigger_reason"], "manual");
        assert_eq!(entry.details["status"], "created");
    }
}
