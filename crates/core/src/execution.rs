use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionType, AutomatedAction};
use crate::approval::RiskLevel;
use crate::pattern::DetectedPattern;
use crate::types::{ActionId, ActorId, ExecutionId, OrganizationId};

/// Lifecycle position of an [`ActionExecution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    AwaitingApproval,
    Ready,
    Executing,
    Scheduled,
    Completed,
    Failed,
    Cancelled,
    RollbackRequested,
    RolledBack,
    RollbackFailed,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::RollbackRequested => "rollback_requested",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    /// Statuses with no further transitions, except that `Completed` may
    /// still enter the rollback sub-state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::RolledBack
                | Self::RollbackFailed
        )
    }

    /// Statuses that hold the `(action, target)` claim.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Created | Self::AwaitingApproval | Self::Ready | Self::Executing | Self::Scheduled
        )
    }

    /// Whether the state machine permits moving from `self` to `to`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use ExecutionStatus::{
            AwaitingApproval, Cancelled, Completed, Created, Executing, Failed, Ready,
            RollbackFailed, RollbackRequested, RolledBack, Scheduled,
        };
        matches!(
            (self, to),
            (Created, AwaitingApproval | Ready | Cancelled)
                | (AwaitingApproval, Ready | Cancelled)
                | (Ready | Scheduled, Executing)
                | (Executing, Completed | Failed | Scheduled)
                | (Scheduled, Cancelled)
                | (Completed, RollbackRequested)
                | (RollbackRequested, RolledBack | RollbackFailed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution was started and what it should act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub trigger_reason: String,
    /// Snapshot of the pattern that prompted the trigger.
    #[serde(default)]
    pub pattern: Option<DetectedPattern>,
    /// Explicit target id, taking precedence over affected entities.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<ActorId>,
    /// Risk assessment supplied by the caller, used for approval priority.
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    /// Free-form event fields from the caller.
    #[serde(default)]
    pub event: serde_json::Value,
}

impl TriggerContext {
    #[must_use]
    pub fn new(trigger_reason: impl Into<String>) -> Self {
        Self {
            trigger_reason: trigger_reason.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: DetectedPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_triggered_by(mut self, actor: impl Into<ActorId>) -> Self {
        self.triggered_by = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: serde_json::Value) -> Self {
        self.event = event;
        self
    }

    /// Resolve the entity this trigger is about.
    ///
    /// Order: explicit `target_id`, then `targetId`/`target_id` in the event
    /// payload, then the first affected entity of `entity_type` (or of any
    /// type when `entity_type` is `None`).
    #[must_use]
    pub fn resolve_target(&self, entity_type: Option<&str>) -> Option<String> {
        if let Some(id) = self.target_id.as_ref().filter(|id| !id.is_empty()) {
            return Some(id.clone());
        }
        for field in ["targetId", "target_id"] {
            if let Some(id) = self.event.get(field).and_then(serde_json::Value::as_str)
                && !id.is_empty()
            {
                return Some(id.to_owned());
            }
        }
        let pattern = self.pattern.as_ref()?;
        let entity = match entity_type {
            Some(kind) => pattern.first_entity_of(kind),
            None => pattern.affected_entities.first(),
        };
        entity.map(|e| e.id.clone())
    }
}

/// A before/after record of one domain change made by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_type: String,
    pub entity_id: String,
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

impl EntityChange {
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            field: field.into(),
            before,
            after,
        }
    }
}

/// Counters and timings recorded for an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Handler attempts. Runs that returned without trying (an open backoff
    /// window) are not counted.
    pub attempts: u32,
    /// Wall time of the last handler invocation.
    pub duration_ms: Option<u64>,
    /// Number of domain changes the handler reported.
    pub changes_applied: usize,
}

/// One attempt at carrying out an [`AutomatedAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: ExecutionId,
    pub action_id: ActionId,
    pub organization_id: OrganizationId,
    pub action_type: ActionType,
    pub trigger_reason: String,
    pub context: TriggerContext,
    /// Target the `(action, target)` claim is held for.
    pub target_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub changes: Vec<EntityChange>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Opaque handler-defined payload used to reverse the execution.
    #[serde(default)]
    pub rollback_data: Option<serde_json::Value>,
    #[serde(default)]
    pub rollback_error: Option<String>,
    #[serde(default)]
    pub approved_by: Option<ActorId>,
    #[serde(default)]
    pub cancelled_by: Option<ActorId>,
    #[serde(default)]
    pub rolled_back_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When a `Scheduled` execution becomes due.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ActionExecution {
    /// A new execution in `Created` for the given action and trigger.
    #[must_use]
    pub fn new(action: &AutomatedAction, context: TriggerContext) -> Self {
        let now = Utc::now();
        let target_id = context.resolve_target(action.config.target_entity_type());
        Self {
            id: ExecutionId::generate(),
            action_id: action.id.clone(),
            organization_id: action.organization_id.clone(),
            action_type: action.action_type,
            trigger_reason: context.trigger_reason.clone(),
            context,
            target_id,
            status: ExecutionStatus::Created,
            metrics: ExecutionMetrics::default(),
            result: None,
            changes: Vec::new(),
            error_message: None,
            rollback_data: None,
            rollback_error: None,
            approved_by: None,
            cancelled_by: None,
            rolled_back_by: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
        }
    }
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub action_id: Option<ActionId>,
    /// Match any of these statuses; empty matches all.
    #[serde(default)]
    pub statuses: Vec<ExecutionStatus>,
    /// Only `Scheduled` executions due at or before this instant.
    pub due_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ExecutionQuery {
    /// Whether an execution satisfies every set filter.
    #[must_use]
    pub fn matches(&self, execution: &ActionExecution) -> bool {
        if let Some(ref action_id) = self.action_id
            && &execution.action_id != action_id
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&execution.status) {
            return false;
        }
        if let Some(due) = self.due_before {
            match execution.next_attempt_at {
                Some(at) if at <= due => {}
                _ => return false,
            }
        }
        true
    }
}
