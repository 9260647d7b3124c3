use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pattern::DetectedPattern;
use crate::types::{ActionId, ActorId, ApprovalId, ExecutionId, OrganizationId};

/// Decision state of an [`ApprovalRequest`]. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn is_decided(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently approvers should look at a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl ApprovalPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for ApprovalPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied risk assessment of running an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A gate in front of one execution, waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub organization_id: OrganizationId,
    pub execution_id: ExecutionId,
    pub action_id: ActionId,
    pub priority: ApprovalPriority,
    pub trigger_reason: String,
    /// Snapshot of the pattern the execution was triggered from.
    #[serde(default)]
    pub context: Option<DetectedPattern>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub requested_by: Option<ActorId>,
    /// Actors notified as eligible approvers.
    #[serde(default)]
    pub assigned_to: Vec<ActorId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<ActorId>,
    #[serde(default)]
    pub decision_reason: Option<String>,
}

impl ApprovalRequest {
    /// Whether the request is still pending but past its deadline.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at <= now
    }
}

/// Time and routing policy applied to approval requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Hours until a pending request expires.
    pub expiration_hours: u32,
    /// Hours a request may stay pending before escalation.
    pub escalate_after_hours: u32,
    /// Tell the requester when their request expires.
    pub notify_requester_on_expiry: bool,
    /// Roles notified for new requests when the action names none.
    pub approver_roles: Vec<String>,
    /// Roles notified on escalation.
    pub escalation_roles: Vec<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            expiration_hours: 24,
            escalate_after_hours: 4,
            notify_requester_on_expiry: true,
            approver_roles: vec!["admin".into(), "manager".into()],
            escalation_roles: vec!["admin".into(), "manager".into()],
        }
    }
}

/// The verdict an approver submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// A decision on an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub decided_by: ActorId,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    #[must_use]
    pub fn approve(by: impl Into<ActorId>) -> Self {
        Self {
            decision: Decision::Approve,
            decided_by: by.into(),
            reason: None,
        }
    }

    #[must_use]
    pub fn reject(by: impl Into<ActorId>, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Reject,
            decided_by: by.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Filter for listing approval requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalQuery {
    pub status: Option<ApprovalStatus>,
    pub execution_id: Option<ExecutionId>,
    /// Only requests created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Only requests that have not been escalated yet.
    #[serde(default)]
    pub unescalated_only: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ApprovalQuery {
    #[must_use]
    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        if let Some(status) = self.status
            && request.status != status
        {
            return false;
        }
        if let Some(ref id) = self.execution_id
            && &request.execution_id != id
        {
            return false;
        }
        if let Some(before) = self.created_before
            && request.created_at > before
        {
            return false;
        }
        if self.unescalated_only && request.escalated_at.is_some() {
            return false;
        }
        true
    }
}
